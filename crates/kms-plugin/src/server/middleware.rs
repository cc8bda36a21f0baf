//! Tower layers applied to the debug router.

use std::time::Duration;

/// Per-request timeout on the debug endpoint. Handlers only read local
/// state, so anything slower is stuck.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
