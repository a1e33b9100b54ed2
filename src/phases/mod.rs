//! Phase template: canonical form, edits and persistence.

mod edit;
mod normalize;
mod store;

pub use edit::{apply_edit, follow_phase, PhaseChanges, PhaseEdit};
pub use normalize::{default_phases, normalize_phases, SHORTCUT_POOL};
pub use store::PhaseStore;
