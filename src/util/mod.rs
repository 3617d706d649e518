pub mod backoff;
pub mod runtime;

pub use backoff::{BackoffConfig, ExponentialBackoff};
