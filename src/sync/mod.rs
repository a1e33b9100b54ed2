pub mod engine;
pub mod worker;

pub use engine::{DraftSyncEngine, SkipReason, SyncOutcome};
pub use worker::{SyncPass, SyncTrigger, SyncWorker};
