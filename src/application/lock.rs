//! Poison recovery for the std locks guarding feed state.
//!
//! Feed state stays usable after a panic in another task: the guard is taken
//! out of the poison error and the next reload corrects anything stale.

use std::sync::LockResult;

use tracing::warn;

/// Unwrap the result of `lock()`, `read()` or `write()`, recovering the guard
/// if a previous holder panicked.
pub(crate) fn recover<G>(result: LockResult<G>, source: &'static str, op: &'static str) -> G {
    result.unwrap_or_else(|poisoned| {
        warn!(
            op,
            source_module = source,
            result = "poisoned_recovered",
            hint = "feed state may be stale until the next reload",
            "Recovered from poisoned lock"
        );
        poisoned.into_inner()
    })
}
