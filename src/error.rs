//! Error handling for the shim.
//!
//! Every operation the shim performs is initiated by a CRI call from the
//! kubelet, so errors are always reported as a gRPC status response. The
//! kubelet is the audience for status messages; anything richer (the
//! underlying I/O error, the offending key or path) goes to the runtime logs
//! with a target matching the status message, so the two can be correlated.
//!
//! Fallible functions on RPC code paths return [`Result`] so `?` works down
//! the whole call stack. Startup-only code uses `anyhow` instead.

use std::fmt::Debug;
use std::result::Result as StdResult;

pub use tonic::{Code, Status};

/// Shorthand for results carrying a gRPC [`Status`].
pub type Result<T> = StdResult<T, Status>;

/// Log an error and turn it into an `Internal` status.
///
/// `target` must be a short, static, kebab-case message unique to the call
/// site, e.g. `checkpoint-write-error`. It ends up both in kubelet logs (as
/// the status message) and in the runtime logs.
pub(crate) fn internal<E: Debug>(target: &'static str) -> impl FnOnce(E) -> Status {
    move |err| {
        tracing::error!(error = ?err, "{target}");
        Status::internal(target)
    }
}
