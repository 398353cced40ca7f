//! Follow-Up Express: runs the follow-up sequencing engine as a standalone
//! process.
//!
//! Campaigns live in an in-memory store, seeded with a demo campaign or
//! loaded from a JSON file. Client replies and operator commands are read
//! from stdin, one per line.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use uuid::Uuid;

use followup_channels::build_gateway;
use followup_core::config::{AppConfig, MetricsConfig, StagePolicy};
use followup_core::types::{CampaignId, META_VARIABLES};
use followup_sequencer::advisor::build_advisor;
use followup_sequencer::engine::seed_demo_campaign;
use followup_sequencer::store::CampaignRecord;
use followup_sequencer::{EngineBuilder, FollowUpEngine, InMemoryStore};

#[derive(Parser, Debug)]
#[command(name = "followup-express")]
#[command(about = "Multi-stage follow-up message sequencing engine")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = "FOLLOWUP_EXPRESS_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "FOLLOWUP_EXPRESS__NODE_ID")]
    node_id: Option<String>,

    /// Multiplier applied to every step wait (overrides config)
    #[arg(long, env = "FOLLOWUP_EXPRESS__SEQUENCER__TIME_SCALE")]
    time_scale: Option<f64>,

    /// `await_response` or `after_delivery` (overrides config)
    #[arg(long, env = "FOLLOWUP_EXPRESS__SEQUENCER__STAGE_POLICY")]
    stage_policy: Option<StagePolicy>,

    /// Campaign to load, as a JSON campaign record. The demo campaign is
    /// seeded when omitted.
    #[arg(long)]
    campaign: Option<PathBuf>,

    /// Enroll a client at startup, as `client_id` or `client_id:Name`.
    /// May be repeated.
    #[arg(long)]
    enroll: Vec<String>,

    /// Skip the Prometheus exporter
    #[arg(long, default_value_t = false)]
    no_metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "followup_express=info,followup_sequencer=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Follow-Up Express starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(time_scale) = cli.time_scale {
        config.sequencer.time_scale = time_scale;
    }
    if let Some(policy) = cli.stage_policy {
        config.sequencer.stage_policy = policy;
    }

    info!(
        node_id = %config.node_id,
        stage_policy = ?config.sequencer.stage_policy,
        time_scale = config.sequencer.time_scale,
        provider = %config.dispatch.provider,
        advisor = config.advisor.enabled,
        "Configuration loaded"
    );

    if !cli.no_metrics {
        if let Err(e) = start_metrics(&config.metrics) {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    let store = Arc::new(InMemoryStore::new());
    let campaign_id = match &cli.campaign {
        Some(path) => load_campaign(&store, path)?,
        None => seed_demo_campaign(&store),
    };

    let gateway = build_gateway(&config.dispatch)?;
    let advisor = build_advisor(&config.advisor)?;
    let engine = EngineBuilder::new(config.sequencer.clone(), store.clone(), gateway)
        .advisor(advisor)
        .build();
    engine.start();

    let recovered = engine.recover().await?;
    if recovered > 0 {
        info!(recovered, "Re-armed persisted timers");
    }

    for entry in &cli.enroll {
        let (client_id, name) = match entry.split_once(':') {
            Some((client_id, name)) => (client_id, Some(name)),
            None => (entry.as_str(), None),
        };
        let mut metadata = serde_json::Map::new();
        if let Some(name) = name {
            metadata.insert(
                META_VARIABLES.to_string(),
                serde_json::json!({ "client_name": name }),
            );
        }
        match engine.enroll(campaign_id, client_id, metadata).await {
            Ok(id) => info!(follow_up_id = %id, client_id, "Enrolled from command line"),
            Err(e) => error!(client_id, error = %e, "Enrollment failed"),
        }
    }

    info!(campaign_id = %campaign_id, "Follow-Up Express is ready; reading commands from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&engine, campaign_id, line.trim()).await,
                Ok(None) => {
                    info!("stdin closed, waiting for shutdown signal");
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read stdin");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.shutdown();
    info!("Follow-Up Express stopped");
    Ok(())
}

fn start_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.host.parse()?, config.port);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(port = config.port, "Metrics exporter started");
    Ok(())
}

fn load_campaign(store: &InMemoryStore, path: &Path) -> anyhow::Result<CampaignId> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading campaign file {}", path.display()))?;
    let record: CampaignRecord = serde_json::from_str(&raw)
        .with_context(|| format!("parsing campaign file {}", path.display()))?;
    let id = record.id;
    store.insert_campaign(record);
    Ok(id)
}

/// Commands:
///
/// ```text
/// <client_id> <text>               client reply
/// /enroll <client_id>              start the campaign for a client
/// /status|pause|resume|advance|cancel <follow_up_id>
/// /receipt <provider_id> <status>  delivery receipt
/// ```
async fn handle_line(engine: &FollowUpEngine, campaign_id: CampaignId, line: &str) {
    if line.is_empty() {
        return;
    }

    let Some(command) = line.strip_prefix('/') else {
        let Some((client_id, text)) = line.split_once(' ') else {
            warn!(line, "Expected `<client_id> <text>`");
            return;
        };
        for (follow_up_id, outcome) in engine.on_client_message(client_id, text.trim()).await {
            info!(follow_up_id = %follow_up_id, outcome = ?outcome, "Reply routed");
        }
        return;
    };

    let mut parts = command.split_whitespace();
    let (Some(verb), Some(arg)) = (parts.next(), parts.next()) else {
        warn!(line, "Command needs an argument");
        return;
    };

    if verb == "enroll" {
        match engine.enroll(campaign_id, arg, serde_json::Map::new()).await {
            Ok(id) => info!(follow_up_id = %id, client_id = arg, "Enrolled"),
            Err(e) => error!(client_id = arg, error = %e, "Enrollment failed"),
        }
        return;
    }
    if verb == "receipt" {
        let status = parts.next().unwrap_or("delivered");
        let outcome = engine.on_provider_receipt(arg, status).await;
        info!(provider_message_id = arg, status, outcome = ?outcome, "Receipt applied");
        return;
    }

    let id = match arg.parse::<Uuid>() {
        Ok(id) => id,
        Err(e) => {
            warn!(arg, error = %e, "Not a follow-up id");
            return;
        }
    };
    let result = match verb {
        "status" => engine
            .status(id)
            .await
            .and_then(|snapshot| serde_json::to_string_pretty(&snapshot).map_err(Into::into)),
        "pause" => engine.pause(id).await.map(|f| format!("{:?}", f.status)),
        "resume" => engine.resume(id).await.map(|f| format!("{:?}", f.status)),
        "advance" => engine.advance_manually(id).await.map(|o| format!("{:?}", o)),
        "cancel" => engine.cancel(id).await.map(|f| format!("{:?}", f.status)),
        other => {
            warn!(command = other, "Unknown command");
            return;
        }
    };
    match result {
        Ok(summary) => {
            info!(follow_up_id = %id, command = verb, result = %summary, "Command applied")
        }
        Err(e) => error!(follow_up_id = %id, command = verb, error = %e, "Command failed"),
    }
}
