// kiln-core/src/lib.rs

// Building, verifying and recording formula installs.
pub mod attempt;
pub mod build;
pub mod pipeline;
pub mod sandbox;
pub mod source;
pub mod verify;

#[cfg(test)]
mod test_support;

pub use attempt::Installer;
pub use pipeline::{run_pipeline, PipelineSummary};
pub use sandbox::{BuildContext, BuildSandbox, Confinement, PathAudit};
pub use source::{AcquiredSource, SourceAcquirer};
pub use verify::{verify, verify_installed};
