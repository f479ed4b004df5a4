//! Per-request forwarding failures.

use std::time::Duration;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The stage at which forwarding one exchange failed.
///
/// Every variant has already been answered with a 500 on the response sink
/// by the time the caller sees it.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("copy request body: {0}")]
    ReadRequestBody(#[source] BoxError),

    #[error("build proxy request: {0}")]
    BuildRequest(#[from] hyper::http::Error),

    #[error("proxy request: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),

    #[error("proxy request: {target} is the proxy itself")]
    SelfTarget { target: String },

    #[error("read response body: {0}")]
    ReadResponseBody(#[source] hyper::Error),

    #[error("{stage}: timed out after {after:?}")]
    Timeout {
        stage: &'static str,
        after: Duration,
    },
}
