use thiserror::Error;
use uuid::Uuid;

use crate::types::FollowUpStatus;

pub type FollowUpResult<T> = Result<T, FollowUpError>;

#[derive(Error, Debug)]
pub enum FollowUpError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Follow-up {0} not found")]
    FollowUpNotFound(Uuid),

    #[error("Campaign {0} not found")]
    CampaignNotFound(Uuid),

    #[error("Campaign {0} has no steps")]
    EmptyCampaign(Uuid),

    #[error("Follow-up {id} cannot {action} while {from:?}")]
    InvalidTransition {
        id: Uuid,
        from: FollowUpStatus,
        action: &'static str,
    },

    #[error("Follow-up {0} was modified concurrently")]
    ConcurrentModification(Uuid),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Advisor error: {0}")]
    Advisor(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FollowUpError {
    /// Definition errors mean the campaign cannot drive the follow-up any
    /// further; callers complete the follow-up instead of retrying.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            FollowUpError::CampaignNotFound(_) | FollowUpError::EmptyCampaign(_)
        )
    }
}
