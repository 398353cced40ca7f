//! Stage-boundary policy: decides where a follow-up goes after a step.

use followup_core::config::StagePolicy;
use followup_core::types::{CampaignDefinition, StageId};

/// Effective move computed after a step was dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Move the cursor to `index`, adopting `stage_id`. `crossed_from` is set
    /// when the move leaves another stage.
    Advance {
        index: usize,
        stage_id: StageId,
        crossed_from: Option<StageId>,
    },
    /// Stay at the boundary of the current stage until a client response or a
    /// manual advance. `boundary_index` is the first step of the next stage.
    Park { boundary_index: usize },
    /// Move the cursor to `index` without adopting its stage yet; the stage is
    /// re-checked for pending deliveries when the step comes due.
    Recheck { index: usize },
    /// No step left.
    Complete,
}

#[derive(Debug, Clone, Copy)]
pub struct StageTransitionResolver {
    policy: StagePolicy,
}

impl StageTransitionResolver {
    pub fn new(policy: StagePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> StagePolicy {
        self.policy
    }

    /// Resolves the move to candidate step `next_index` from `current_stage`.
    /// `stage_delivered` reports whether every outbound message of the
    /// current stage has left the pending state; only `AfterDelivery`
    /// consults it.
    pub fn resolve(
        &self,
        campaign: &CampaignDefinition,
        next_index: usize,
        current_stage: Option<StageId>,
        stage_delivered: bool,
    ) -> Transition {
        let Some(candidate) = campaign.steps.get(next_index) else {
            return Transition::Complete;
        };

        let current = match current_stage {
            Some(current) if current != candidate.stage_id => current,
            _ => {
                return Transition::Advance {
                    index: next_index,
                    stage_id: candidate.stage_id,
                    crossed_from: None,
                }
            }
        };

        if !campaign.is_later_stage(candidate.stage_id, current) {
            return Transition::Advance {
                index: next_index,
                stage_id: candidate.stage_id,
                crossed_from: Some(current),
            };
        }

        match self.policy {
            StagePolicy::AwaitResponse => {
                let same_stage = campaign
                    .steps
                    .iter()
                    .enumerate()
                    .skip(next_index + 1)
                    .find(|(_, step)| step.stage_id == current);
                match same_stage {
                    Some((index, _)) => Transition::Advance {
                        index,
                        stage_id: current,
                        crossed_from: None,
                    },
                    None => Transition::Park {
                        boundary_index: next_index,
                    },
                }
            }
            StagePolicy::AfterDelivery if stage_delivered => Transition::Advance {
                index: next_index,
                stage_id: candidate.stage_id,
                crossed_from: Some(current),
            },
            StagePolicy::AfterDelivery => Transition::Recheck { index: next_index },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use followup_core::types::{FunnelStage, StepDefinition};
    use uuid::Uuid;

    fn campaign(layout: &[(i32, usize)]) -> CampaignDefinition {
        let mut stages = Vec::new();
        let mut steps = Vec::new();
        for (order, count) in layout {
            let stage = FunnelStage {
                id: Uuid::new_v4(),
                name: format!("stage-{}", order),
                order: *order,
            };
            for n in 0..*count {
                steps.push(StepDefinition {
                    id: Uuid::new_v4(),
                    stage_id: stage.id,
                    message: format!("{}-{}", order, n),
                    delay: "0".to_string(),
                    wait_time_ms: n as u64,
                    template_name: None,
                    category: None,
                    auto_respond: false,
                });
            }
            stages.push(stage);
        }
        CampaignDefinition {
            id: Uuid::new_v4(),
            name: "t".to_string(),
            stages,
            steps,
        }
    }

    #[test]
    fn test_same_stage_advances() {
        let c = campaign(&[(1, 2), (2, 1)]);
        let resolver = StageTransitionResolver::new(StagePolicy::AwaitResponse);
        assert_eq!(
            resolver.resolve(&c, 1, Some(c.stages[0].id), false),
            Transition::Advance {
                index: 1,
                stage_id: c.stages[0].id,
                crossed_from: None
            }
        );
    }

    #[test]
    fn test_await_response_parks_at_boundary() {
        let c = campaign(&[(1, 2), (2, 1)]);
        let resolver = StageTransitionResolver::new(StagePolicy::AwaitResponse);
        assert_eq!(
            resolver.resolve(&c, 2, Some(c.stages[0].id), true),
            Transition::Park { boundary_index: 2 }
        );
    }

    #[test]
    fn test_await_response_prefers_remaining_current_stage_step() {
        // Unsorted definition: a stage-1 step sits after a stage-2 step.
        let mut c = campaign(&[(1, 2), (2, 1)]);
        c.steps.swap(1, 2);
        let resolver = StageTransitionResolver::new(StagePolicy::AwaitResponse);
        assert_eq!(
            resolver.resolve(&c, 1, Some(c.stages[0].id), false),
            Transition::Advance {
                index: 2,
                stage_id: c.stages[0].id,
                crossed_from: None
            }
        );
    }

    #[test]
    fn test_after_delivery_crosses_only_when_delivered() {
        let c = campaign(&[(1, 1), (2, 1)]);
        let resolver = StageTransitionResolver::new(StagePolicy::AfterDelivery);
        assert_eq!(
            resolver.resolve(&c, 1, Some(c.stages[0].id), false),
            Transition::Recheck { index: 1 }
        );
        assert_eq!(
            resolver.resolve(&c, 1, Some(c.stages[0].id), true),
            Transition::Advance {
                index: 1,
                stage_id: c.stages[1].id,
                crossed_from: Some(c.stages[0].id)
            }
        );
    }

    #[test]
    fn test_past_last_step_completes() {
        let c = campaign(&[(1, 1)]);
        let resolver = StageTransitionResolver::new(StagePolicy::AfterDelivery);
        assert_eq!(
            resolver.resolve(&c, 1, Some(c.stages[0].id), true),
            Transition::Complete
        );
    }
}
