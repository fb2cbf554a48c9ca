// kiln-core/src/build/mod.rs
// Running install recipes and publishing the resulting keg.

pub mod executor;
pub mod link;
pub mod substitute;

pub use executor::execute;
pub use link::{link_keg, InstallReceipt, KegLinks};
pub use substitute::Substitutions;
