//! Follow-up sequencing: resolves campaign steps, dispatches them on a
//! per-follow-up timer, reacts to client responses and exposes the manual
//! control surface (pause, resume, advance, cancel).

pub mod advisor;
pub mod control;
pub mod engine;
pub mod memory;
pub mod resolver;
pub mod response;
pub mod scheduler;
pub mod sequencer;
pub mod store;
pub mod transition;

pub use control::{FollowUpControl, FollowUpSnapshot};
pub use engine::{EngineBuilder, FollowUpEngine};
pub use memory::InMemoryStore;
pub use resolver::CampaignResolver;
pub use response::{ResponseHandler, ResponseOutcome};
pub use scheduler::{Scheduler, TimerFire};
pub use sequencer::{Sequencer, StepOutcome, StepProcessor};
pub use store::SequenceStore;
pub use transition::{StageTransitionResolver, Transition};
