//! Campaign definition resolution: loads stages and steps, normalizes the
//! stored step payloads into `StepDefinition` and orders them for traversal.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};
use uuid::Uuid;

use followup_core::duration::parse_delay;
use followup_core::error::{FollowUpError, FollowUpResult};
use followup_core::types::{CampaignDefinition, CampaignId, FunnelStage, StageId, StepDefinition};

use crate::store::{CampaignRecord, LegacyStepRecord, SequenceStore};

/// Structured step as it may appear in storage. Older editors wrote
/// `funnel_stage_id` and `message_content`; both spellings are accepted here
/// and nowhere else.
#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    id: Option<Uuid>,
    #[serde(default)]
    stage_id: Option<Uuid>,
    #[serde(default)]
    funnel_stage_id: Option<Uuid>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    message_content: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    delay: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    wait_time: Option<String>,
    #[serde(default)]
    wait_time_ms: Option<u64>,
    #[serde(default)]
    template_name: Option<String>,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    auto_respond: bool,
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Resolved delay of a step. A step without any delay is sent right away.
fn resolve_wait(delay: Option<String>, wait_time_ms: Option<u64>) -> (String, u64) {
    match (delay, wait_time_ms) {
        (delay, Some(ms)) => (delay.unwrap_or_else(|| format!("{}ms", ms)), ms),
        (Some(delay), None) => {
            let ms = parse_delay(&delay);
            (delay, ms)
        }
        (None, None) => ("0".to_string(), 0),
    }
}

/// Loads campaign definitions from the store in canonical form.
#[derive(Clone)]
pub struct CampaignResolver {
    store: Arc<dyn SequenceStore>,
}

impl CampaignResolver {
    pub fn new(store: Arc<dyn SequenceStore>) -> Self {
        Self { store }
    }

    /// Returns the campaign with stages ordered by `order` and steps ordered
    /// by `(stage order, wait_time_ms)`. Malformed step data yields an empty
    /// step list; the caller decides what that means for a follow-up.
    pub async fn resolve(&self, campaign_id: CampaignId) -> FollowUpResult<CampaignDefinition> {
        let record = self
            .store
            .get_campaign(campaign_id)
            .await?
            .ok_or(FollowUpError::CampaignNotFound(campaign_id))?;

        let mut stages = record.stages.clone();
        stages.sort_by_key(|s| s.order);

        let steps = match structured_steps(&record) {
            StructuredSteps::Present(raw) => normalize_structured(campaign_id, &stages, raw),
            StructuredSteps::Malformed => Vec::new(),
            StructuredSteps::Absent => {
                let rows = self.store.legacy_import(campaign_id).await?;
                debug!(
                    campaign_id = %campaign_id,
                    rows = rows.len(),
                    "No structured steps, using legacy import"
                );
                normalize_legacy(campaign_id, &mut stages, rows)
            }
        };

        let mut definition = CampaignDefinition {
            id: record.id,
            name: record.name,
            stages,
            steps,
        };
        sort_steps(&mut definition);
        Ok(definition)
    }
}

enum StructuredSteps {
    Present(Vec<RawStep>),
    Malformed,
    Absent,
}

fn structured_steps(record: &CampaignRecord) -> StructuredSteps {
    let Some(value) = &record.steps else {
        return StructuredSteps::Absent;
    };
    if value.is_null() {
        return StructuredSteps::Absent;
    }
    match serde_json::from_value::<Vec<RawStep>>(value.clone()) {
        Ok(raw) if raw.is_empty() => StructuredSteps::Absent,
        Ok(raw) => StructuredSteps::Present(raw),
        Err(e) => {
            warn!(campaign_id = %record.id, error = %e, "Malformed stored step list");
            StructuredSteps::Malformed
        }
    }
}

fn normalize_structured(
    campaign_id: CampaignId,
    stages: &[FunnelStage],
    raw: Vec<RawStep>,
) -> Vec<StepDefinition> {
    raw.into_iter()
        .enumerate()
        .filter_map(|(position, step)| {
            let Some(stage_id) = step.stage_id.or(step.funnel_stage_id) else {
                warn!(campaign_id = %campaign_id, position, "Step without a stage, skipping");
                return None;
            };
            if !stages.iter().any(|s| s.id == stage_id) {
                warn!(
                    campaign_id = %campaign_id,
                    stage_id = %stage_id,
                    position,
                    "Step references an unknown stage, skipping"
                );
                return None;
            }
            let (delay, wait_time_ms) =
                resolve_wait(step.delay.or(step.wait_time), step.wait_time_ms);
            Some(StepDefinition {
                id: step
                    .id
                    .unwrap_or_else(|| derived_id(campaign_id, &format!("step:{}", position))),
                stage_id,
                message: step.message.or(step.message_content).unwrap_or_default(),
                delay,
                wait_time_ms,
                template_name: step.template_name.or(step.template),
                category: step.category,
                auto_respond: step.auto_respond,
            })
        })
        .collect()
}

/// Legacy rows name their stage by display name or by numeric order. Rows
/// naming a stage the campaign does not have get a synthetic stage ordered
/// after every known one, in order of first appearance.
fn normalize_legacy(
    campaign_id: CampaignId,
    stages: &mut Vec<FunnelStage>,
    rows: Vec<LegacyStepRecord>,
) -> Vec<StepDefinition> {
    let mut by_key: HashMap<String, StageId> = HashMap::new();
    let mut next_order = stages.iter().map(|s| s.order).max().unwrap_or(0) + 1;
    let mut steps = Vec::with_capacity(rows.len());

    for (position, row) in rows.into_iter().enumerate() {
        let key = row.stage.trim().to_lowercase();
        let stage_id = match by_key.get(&key) {
            Some(id) => *id,
            None => {
                let id = match match_stage(stages, &key) {
                    Some(id) => id,
                    None => {
                        let stage = FunnelStage {
                            id: derived_id(campaign_id, &format!("stage:{}", key)),
                            name: row.stage.trim().to_string(),
                            order: next_order,
                        };
                        next_order += 1;
                        debug!(
                            campaign_id = %campaign_id,
                            stage = %stage.name,
                            order = stage.order,
                            "Synthesized stage for legacy import"
                        );
                        let id = stage.id;
                        stages.push(stage);
                        id
                    }
                };
                by_key.insert(key, id);
                id
            }
        };

        let (delay, wait_time_ms) = resolve_wait(row.wait_time, None);
        steps.push(StepDefinition {
            id: derived_id(campaign_id, &format!("legacy:{}", position)),
            stage_id,
            message: row.message,
            delay,
            wait_time_ms,
            template_name: row.template_name,
            category: row.category,
            auto_respond: row.auto_respond,
        });
    }
    steps
}

fn match_stage(stages: &[FunnelStage], key: &str) -> Option<StageId> {
    if let Some(stage) = stages.iter().find(|s| s.name.trim().to_lowercase() == key) {
        return Some(stage.id);
    }
    let order: i32 = key.parse().ok()?;
    stages.iter().find(|s| s.order == order).map(|s| s.id)
}

fn derived_id(campaign_id: CampaignId, name: &str) -> Uuid {
    Uuid::new_v5(&campaign_id, name.as_bytes())
}

fn sort_steps(definition: &mut CampaignDefinition) {
    definition.stages.sort_by_key(|s| s.order);
    let orders: HashMap<StageId, i32> = definition
        .stages
        .iter()
        .map(|s| (s.id, s.order))
        .collect();
    definition.steps.sort_by_key(|step| {
        (
            orders.get(&step.stage_id).copied().unwrap_or(i32::MAX),
            step.wait_time_ms,
        )
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use serde_json::json;

    fn stage(order: i32, name: &str) -> FunnelStage {
        FunnelStage {
            id: Uuid::new_v4(),
            name: name.to_string(),
            order,
        }
    }

    fn resolver_with(store: InMemoryStore) -> CampaignResolver {
        CampaignResolver::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_missing_campaign_is_definition_error() {
        let resolver = resolver_with(InMemoryStore::new());
        let err = resolver.resolve(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_definition_error());
    }

    #[tokio::test]
    async fn test_aliases_are_normalized() {
        let store = InMemoryStore::new();
        let s1 = stage(1, "Abertura");
        let campaign_id = Uuid::new_v4();
        store.insert_campaign(CampaignRecord {
            id: campaign_id,
            name: "aliases".to_string(),
            stages: vec![s1.clone()],
            steps: Some(json!([
                {"funnel_stage_id": s1.id, "message_content": "Oi {{client_name}}", "wait_time": "10 minutos"},
                {"stage_id": s1.id, "message": "Olá", "delay": "imediatamente", "template": "hello_v1"},
                {"stage_id": s1.id, "content_is_ignored": true, "message": "Sem atraso"}
            ])),
        });

        let definition = resolver_with(store).resolve(campaign_id).await.unwrap();
        let messages: Vec<&str> = definition.steps.iter().map(|s| s.message.as_str()).collect();
        assert_eq!(messages, vec!["Olá", "Sem atraso", "Oi {{client_name}}"]);
        assert_eq!(definition.steps[0].template_name.as_deref(), Some("hello_v1"));
        assert_eq!(definition.steps[1].wait_time_ms, 0);
        assert_eq!(definition.steps[2].wait_time_ms, 600_000);
        assert!(definition.steps.iter().all(|s| s.stage_id == s1.id));
    }

    #[tokio::test]
    async fn test_malformed_steps_yield_empty_list() {
        let store = InMemoryStore::new();
        let campaign_id = Uuid::new_v4();
        store.insert_campaign(CampaignRecord {
            id: campaign_id,
            name: "broken".to_string(),
            stages: vec![stage(1, "x")],
            steps: Some(json!({"not": "a list"})),
        });

        let definition = resolver_with(store).resolve(campaign_id).await.unwrap();
        assert!(definition.steps.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_stage_is_skipped() {
        let store = InMemoryStore::new();
        let s1 = stage(1, "known");
        let campaign_id = Uuid::new_v4();
        store.insert_campaign(CampaignRecord {
            id: campaign_id,
            name: "partial".to_string(),
            stages: vec![s1.clone()],
            steps: Some(json!([
                {"stage_id": s1.id, "message": "kept"},
                {"stage_id": Uuid::new_v4(), "message": "dropped"}
            ])),
        });

        let definition = resolver_with(store).resolve(campaign_id).await.unwrap();
        assert_eq!(definition.steps.len(), 1);
        assert_eq!(definition.steps[0].message, "kept");
    }

    #[tokio::test]
    async fn test_legacy_import_fallback() {
        let store = InMemoryStore::new();
        let welcome = stage(1, "Boas-vindas");
        let campaign_id = Uuid::new_v4();
        store.insert_campaign(CampaignRecord {
            id: campaign_id,
            name: "legacy".to_string(),
            stages: vec![welcome.clone()],
            steps: Some(json!([])),
        });
        store.insert_legacy_import(
            campaign_id,
            serde_json::from_value(json!([
                {"stage": "Fechamento", "message": "Fechamos?", "wait_time": "1 dia"},
                {"stage": "boas-vindas", "message": "Bem-vindo!", "wait_time": "imediatamente"},
                {"stage": "1", "message": "Conseguiu ver?", "wait_time": 30}
            ]))
            .unwrap(),
        );

        let resolver = resolver_with(store);
        let definition = resolver.resolve(campaign_id).await.unwrap();

        assert_eq!(definition.stages.len(), 2);
        assert_eq!(definition.stages[1].name, "Fechamento");
        assert_eq!(definition.stages[1].order, 2);
        let messages: Vec<&str> = definition.steps.iter().map(|s| s.message.as_str()).collect();
        assert_eq!(messages, vec!["Bem-vindo!", "Conseguiu ver?", "Fechamos?"]);
        assert_eq!(definition.steps[1].wait_time_ms, 1_800_000);

        // Ids are stable across resolutions.
        let again = resolver.resolve(campaign_id).await.unwrap();
        assert_eq!(definition.steps[2].id, again.steps[2].id);
        assert_eq!(definition.stages[1].id, again.stages[1].id);
    }

    #[tokio::test]
    async fn test_shuffled_steps_are_sorted_by_stage_then_wait() {
        let mut rng = StdRng::seed_from_u64(42);
        let stages = vec![stage(3, "c"), stage(1, "a"), stage(2, "b")];

        for _ in 0..20 {
            let mut raw = Vec::new();
            for s in &stages {
                for wait in [0u64, 60_000, 3_600_000, 60_000] {
                    raw.push(json!({
                        "stage_id": s.id,
                        "message": format!("{}-{}", s.name, wait),
                        "wait_time_ms": wait,
                    }));
                }
            }
            raw.shuffle(&mut rng);

            let store = InMemoryStore::new();
            let campaign_id = Uuid::new_v4();
            store.insert_campaign(CampaignRecord {
                id: campaign_id,
                name: "shuffled".to_string(),
                stages: stages.clone(),
                steps: Some(serde_json::Value::Array(raw)),
            });

            let definition = resolver_with(store).resolve(campaign_id).await.unwrap();
            assert_eq!(definition.steps.len(), 12);
            let keys: Vec<(i32, u64)> = definition
                .steps
                .iter()
                .map(|s| (definition.stage_order(s.stage_id).unwrap(), s.wait_time_ms))
                .collect();
            let mut sorted = keys.clone();
            sorted.sort();
            assert_eq!(keys, sorted);
        }
    }
}
