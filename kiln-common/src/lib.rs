// kiln-common/src/lib.rs
pub mod config;
pub mod dependency;
pub mod error;
pub mod formulary;
pub mod keg;
pub mod model;
pub mod pipeline;

pub use config::Config;
pub use error::{ErrorCategory, KilnError, Result};
pub use formulary::Formulary;
pub use keg::{InstalledIndex, InstalledKeg};
pub use model::Formula;
