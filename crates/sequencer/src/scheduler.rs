//! One-shot, per-follow-up timers.
//!
//! Every armed timer carries a generation number. Arming a new timer for a
//! follow-up aborts the previous one, and a fire is only honored if its
//! generation is still the armed one (see [`Scheduler::claim`]), so at most
//! one fire per follow-up is ever acted upon. Armed timers are mirrored as
//! [`ScheduledJob`]s in the store so [`Scheduler::recover`] can re-arm them
//! after a restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use followup_core::duration::{due_after, MAX_DELAY_MS};
use followup_core::error::FollowUpResult;
use followup_core::types::{FollowUpId, ScheduledJob};

use crate::store::SequenceStore;

/// Delivered to the engine's driver loop when a timer elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFire {
    pub follow_up_id: FollowUpId,
    /// Step index the follow-up must still be on for the fire to apply.
    pub target_index: usize,
    pub generation: u64,
    pub armed_at: DateTime<Utc>,
}

struct ArmedTimer {
    generation: u64,
    target_index: usize,
    handle: Option<JoinHandle<()>>,
}

pub struct Scheduler {
    store: Arc<dyn SequenceStore>,
    armed: DashMap<FollowUpId, ArmedTimer>,
    next_generation: AtomicU64,
    fire_tx: mpsc::UnboundedSender<TimerFire>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("armed", &self.armed.len())
            .finish()
    }
}

impl Scheduler {
    pub fn new(store: Arc<dyn SequenceStore>) -> (Self, mpsc::UnboundedReceiver<TimerFire>) {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            store,
            armed: DashMap::new(),
            next_generation: AtomicU64::new(1),
            fire_tx,
        };
        (scheduler, fire_rx)
    }

    /// Arms a timer that fires after `delay_ms`, superseding any timer
    /// already armed for the follow-up. Returns the new generation.
    pub async fn schedule(
        &self,
        follow_up_id: FollowUpId,
        target_index: usize,
        delay_ms: u64,
    ) -> u64 {
        self.arm(follow_up_id, target_index, delay_ms, Utc::now()).await
    }

    /// Arms a timer for an absolute due time; past due times fire at once.
    pub async fn schedule_at(
        &self,
        follow_up_id: FollowUpId,
        target_index: usize,
        due_at: DateTime<Utc>,
    ) -> u64 {
        self.schedule(follow_up_id, target_index, millis_until(due_at))
            .await
    }

    async fn arm(
        &self,
        follow_up_id: FollowUpId,
        target_index: usize,
        delay_ms: u64,
        armed_at: DateTime<Utc>,
    ) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let delay_ms = delay_ms.min(MAX_DELAY_MS);
        let delay = Duration::from_millis(delay_ms);

        // The entry goes in before the task exists so a zero-delay fire can
        // never race ahead of its own registration.
        let previous = self.armed.insert(
            follow_up_id,
            ArmedTimer {
                generation,
                target_index,
                handle: None,
            },
        );
        if let Some(handle) = previous.and_then(|p| p.handle) {
            handle.abort();
        }

        let fire = TimerFire {
            follow_up_id,
            target_index,
            generation,
            armed_at,
        };
        let tx = self.fire_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(fire).is_err() {
                debug!(follow_up_id = %follow_up_id, "Timer fired after driver shut down");
            }
        });

        match self.armed.get_mut(&follow_up_id) {
            Some(mut entry) if entry.generation == generation => entry.handle = Some(handle),
            _ => handle.abort(),
        }

        let due_at = due_after(Utc::now(), delay_ms);
        let job = ScheduledJob {
            follow_up_id,
            target_index,
            due_at,
            generation,
            armed_at,
        };
        if let Err(e) = self.store.put_job(job).await {
            warn!(follow_up_id = %follow_up_id, error = %e, "Failed to persist scheduled job");
        } else if !self.is_generation_armed(follow_up_id, generation) {
            // Canceled or superseded while persisting.
            let _ = self.store.remove_job_generation(follow_up_id, generation).await;
        }

        metrics::counter!("scheduler.timers_armed").increment(1);
        debug!(
            follow_up_id = %follow_up_id,
            target_index,
            delay_ms,
            generation,
            "Timer armed"
        );
        generation
    }

    /// Invalidates any outstanding timer for the follow-up.
    pub async fn cancel_all(&self, follow_up_id: FollowUpId) {
        if let Some((_, timer)) = self.armed.remove(&follow_up_id) {
            if let Some(handle) = timer.handle {
                handle.abort();
            }
            metrics::counter!("scheduler.timers_canceled").increment(1);
            debug!(follow_up_id = %follow_up_id, generation = timer.generation, "Timer canceled");
        }
        if let Err(e) = self.store.remove_job(follow_up_id).await {
            warn!(follow_up_id = %follow_up_id, error = %e, "Failed to remove scheduled job");
        }
    }

    /// Takes ownership of a fire. Returns false if the timer was canceled or
    /// superseded after it elapsed.
    pub fn claim(&self, fire: &TimerFire) -> bool {
        self.armed
            .remove_if(&fire.follow_up_id, |_, timer| timer.generation == fire.generation)
            .is_some()
    }

    /// Drops the persisted job of a claimed fire.
    pub async fn release_job(&self, fire: &TimerFire) {
        if let Err(e) = self
            .store
            .remove_job_generation(fire.follow_up_id, fire.generation)
            .await
        {
            warn!(follow_up_id = %fire.follow_up_id, error = %e, "Failed to release scheduled job");
        }
    }

    pub fn is_armed(&self, follow_up_id: FollowUpId) -> bool {
        self.armed.contains_key(&follow_up_id)
    }

    pub fn armed_target(&self, follow_up_id: FollowUpId) -> Option<usize> {
        self.armed.get(&follow_up_id).map(|t| t.target_index)
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    fn is_generation_armed(&self, follow_up_id: FollowUpId, generation: u64) -> bool {
        self.armed
            .get(&follow_up_id)
            .map(|t| t.generation == generation)
            .unwrap_or(false)
    }

    /// Re-arms every persisted job that has no live timer. Overdue jobs fire
    /// immediately. Returns the number of timers armed.
    pub async fn recover(&self) -> FollowUpResult<usize> {
        let jobs = self.store.pending_jobs().await?;
        let mut recovered = 0;
        for job in jobs {
            if self.is_armed(job.follow_up_id) {
                continue;
            }
            self.arm(
                job.follow_up_id,
                job.target_index,
                millis_until(job.due_at),
                job.armed_at,
            )
            .await;
            recovered += 1;
        }
        info!(recovered, "Scheduled jobs recovered");
        Ok(recovered)
    }
}

fn millis_until(due_at: DateTime<Utc>) -> u64 {
    (due_at - Utc::now()).num_milliseconds().max(0) as u64
}
