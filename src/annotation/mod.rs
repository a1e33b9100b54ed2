pub mod capture;
pub mod controller;
pub mod events;
pub mod ownership;

pub use capture::{Boundary, BoundaryCapture, BoundaryClick, CaptureStatus};
pub use controller::{AnnotationController, AnnotationSnapshot, ClickResult, LoadOutcome};
pub use events::{build_events, AnnotationEvent};
pub use ownership::{AutoFork, DenyFork, ForkConfirmer, Ownership};
