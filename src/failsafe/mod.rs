//! Failsafe mechanisms for backend calls

mod retry;

pub use retry::{RetryPolicy, with_retry};
