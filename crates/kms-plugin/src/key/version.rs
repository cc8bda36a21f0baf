//! [`KeyVersionSlot`]: the process-wide record of which key version is in use.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Holds the key version the server is operating on.
///
/// Starts out either pinned (from configuration) or empty. An empty slot is
/// filled at most once: the first resolved version wins and later attempts
/// are ignored, so readers never observe a torn or flapping value.
#[derive(Clone, Debug, Default)]
pub struct KeyVersionSlot {
    inner: Arc<ArcSwapOption<String>>,
}

impl KeyVersionSlot {
    pub fn new(initial: Option<String>) -> Self {
        Self {
            inner: Arc::new(ArcSwapOption::from(initial.map(Arc::new))),
        }
    }

    /// The current version, if one has been configured or resolved.
    pub fn get(&self) -> Option<Arc<String>> {
        self.inner.load_full()
    }

    /// Fill the slot with `version` if it is still empty.
    ///
    /// Returns `true` if this call filled the slot.
    pub fn set_if_unresolved(&self, version: &str) -> bool {
        let unresolved: Option<Arc<String>> = None;
        let previous = self
            .inner
            .compare_and_swap(&unresolved, Some(Arc::new(version.to_owned())));
        previous.is_none()
    }
}
