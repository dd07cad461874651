use std::sync::{Arc, Mutex};

/// Single-slot mailbox. A newer value overwrites one that was not yet taken; the
/// producer never blocks on the consumer.
#[derive(Debug)]
pub struct LatestSlot<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for LatestSlot<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value that was overwritten, if any.
    pub fn post(&self, value: T) -> Option<T> {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(value)
    }

    pub fn take(&self) -> Option<T> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_value_wins() {
        let slot = LatestSlot::new();
        assert_eq!(slot.post(1), None);
        assert_eq!(slot.clone().post(2), Some(1));
        assert_eq!(slot.take(), Some(2));
        assert_eq!(slot.take(), None);
    }
}
