//! Binary semaphores ordering dispatches against each other.
//!
//! Waiting does not consume the signal: every dispatch waiting on a signaled
//! semaphore proceeds until the semaphore is reset.

use std::sync::Arc;

use anvil_core::{HalError, HalResult, HostCharge, ObjectId};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct SemaphoreState {
    signaled: bool,
    /// Dispatches that will wait on or signal the semaphore.
    pending_uses: usize,
}

#[derive(Debug)]
pub(crate) struct SemaphoreShared {
    id: ObjectId,
    state: Mutex<SemaphoreState>,
    changed: Condvar,
}

impl SemaphoreShared {
    pub(crate) fn acquire_use(&self) {
        self.state.lock().pending_uses += 1;
    }

    pub(crate) fn release_use(&self) {
        let mut state = self.state.lock();
        state.pending_uses = state.pending_uses.saturating_sub(1);
    }

    pub(crate) fn signal(&self) {
        self.state.lock().signaled = true;
        self.changed.notify_all();
    }

    /// Blocks until signaled. Never returns for a semaphore nobody signals.
    pub(crate) fn wait(&self) {
        let mut state = self.state.lock();
        while !state.signaled {
            self.changed.wait(&mut state);
        }
    }
}

/// A semaphore.
#[derive(Debug)]
pub struct Semaphore {
    shared: Arc<SemaphoreShared>,
    device: ObjectId,
    _charge: HostCharge,
}

impl Semaphore {
    pub(crate) fn new(id: ObjectId, device: ObjectId, charge: HostCharge) -> Self {
        Self {
            shared: Arc::new(SemaphoreShared {
                id,
                state: Mutex::new(SemaphoreState::default()),
                changed: Condvar::new(),
            }),
            device,
            _charge: charge,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<SemaphoreShared> {
        &self.shared
    }

    /// Object id.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.shared.id
    }

    /// Id of the owning device.
    #[must_use]
    pub fn device_id(&self) -> ObjectId {
        self.device
    }

    /// True once signaled and not yet reset.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.shared.state.lock().signaled
    }

    /// Clears the signal.
    ///
    /// # Errors
    ///
    /// [`HalError::InvalidValue`] while a dispatch still waits on or signals
    /// the semaphore.
    pub fn reset(&mut self) -> HalResult<()> {
        let mut state = self.shared.state.lock();
        if state.pending_uses > 0 {
            return Err(HalError::invalid(format!(
                "semaphore {} is used by {} pending dispatches",
                self.shared.id, state.pending_uses
            )));
        }
        state.signaled = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::{HostAllocator, ObjectType, SystemAllocator};
    use std::time::Duration;

    fn semaphore() -> Semaphore {
        let allocator: Arc<dyn HostAllocator> = Arc::new(SystemAllocator::new());
        Semaphore::new(
            ObjectId::new(ObjectType::Semaphore, 0),
            ObjectId::new(ObjectType::Device, 0),
            HostCharge::for_object::<SemaphoreShared>(&allocator).unwrap(),
        )
    }

    #[test]
    fn test_wait_after_signal_returns() {
        let semaphore = semaphore();
        semaphore.shared().signal();
        semaphore.shared().wait();
        semaphore.shared().wait();
        assert!(semaphore.is_signaled());
    }

    #[test]
    fn test_reset_refused_while_in_use() {
        let mut semaphore = semaphore();
        semaphore.shared().signal();
        semaphore.shared().acquire_use();
        assert!(semaphore.reset().is_err());
        semaphore.shared().release_use();
        semaphore.reset().unwrap();
        assert!(!semaphore.is_signaled());
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let semaphore = semaphore();
        let shared = Arc::clone(semaphore.shared());
        let waiter = std::thread::spawn(move || shared.wait());
        std::thread::sleep(Duration::from_millis(10));
        semaphore.shared().signal();
        waiter.join().unwrap();
    }
}
