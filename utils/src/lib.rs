//! The inevitable catchall "utils" crate. Generally only add
//! things here that only depend on the standard library and
//! "core" crates.
//!
mod backoff;
mod tracing_util;
pub use backoff::*;
pub use tracing_util::*;
