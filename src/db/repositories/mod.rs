pub mod drafts;
pub mod phases;
