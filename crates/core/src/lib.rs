//! Shared building blocks for the follow-up sequencing engine: configuration,
//! errors, domain types, lifecycle events, delay parsing, template rendering
//! and the contracts of the external collaborators (dispatch and advisor).

pub mod advisor;
pub mod config;
pub mod duration;
pub mod error;
pub mod event_bus;
pub mod gateway;
pub mod templates;
pub mod types;

pub use config::AppConfig;
pub use error::{FollowUpError, FollowUpResult};
