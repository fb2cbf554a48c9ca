// kiln-net/src/lib.rs
pub mod http;
pub mod retry;
pub mod validation;

pub use http::{build_http_client, fetch_archive};
pub use retry::{fetch_with_retry, RetryPolicy};
pub use validation::validate_url;
