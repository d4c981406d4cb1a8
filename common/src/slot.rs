use arc_swap::ArcSwapOption;
use std::sync::Arc;

/// Lock-free "latest value" mailbox between a producer and a consumer thread.
///
/// Only the most recent value is kept. Consumers either peek at it or take it,
/// in which case the slot becomes empty until the next publish.
#[derive(Debug)]
pub struct Slot<T> {
    value: ArcSwapOption<T>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slot<T> {
    pub fn new() -> Self {
        Self {
            value: ArcSwapOption::empty(),
        }
    }

    pub fn publish(&self, val: T) {
        self.value.store(Some(Arc::new(val)));
    }

    pub fn take(&self) -> Option<Arc<T>> {
        self.value.swap(None)
    }

    pub fn peek(&self) -> Option<Arc<T>> {
        self.value.load_full()
    }

    pub fn clear(&self) {
        self.value.store(None);
    }

    pub fn has_value(&self) -> bool {
        self.value.load().is_some()
    }
}
