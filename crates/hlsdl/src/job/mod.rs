//! Download jobs: state machine, events, link import and the controller that runs them.

pub mod events;
pub mod import;
pub mod manager;
pub mod state;

pub use events::JobEvent;
pub use import::{ImportEntry, ImportReport, fallback_name, parse_import};
pub use manager::{ImportSummary, JobManager};
pub use state::{Job, JobId, JobSnapshot, JobStatus, TrackProgress, TrackSnapshot, VariantSummary};
