pub mod formula;
pub mod placeholder;
pub mod recipe;
pub mod source;

pub use formula::Formula;
pub use placeholder::{ArgBundle, PathVar, Segment, Template};
pub use recipe::{Assertion, InstallStep};
pub use source::{SourceReference, SourceSpec};
