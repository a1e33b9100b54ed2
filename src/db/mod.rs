//! Local persistence: phase configuration and unsynced drafts survive
//! restarts here until they are synced or discarded.

mod connection;
pub mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use connection::Database;
pub use repositories::phases::PHASE_CONFIG_SLOT;
