pub mod draft;
pub mod phase;
pub mod segment;
pub mod version;

pub use draft::{draft_id, Draft, DraftStatus};
pub use phase::Phase;
pub use segment::{Segment, SegmentPatch, TrialKey};
pub use version::{VersionMeta, VersionStatus};
