//! Host-observable completion signal for one dispatch at a time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anvil_core::{HalError, HalResult, HostCharge, ObjectId, ResultCode};
use parking_lot::{Condvar, Mutex};

/// Outcome of a fence wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    /// The dispatch completed successfully.
    Signaled,
    /// The dispatch has not completed within the timeout.
    NotReady,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending { queue: ObjectId },
    Signaled { queue: ObjectId, code: ResultCode },
}

#[derive(Debug)]
pub(crate) struct FenceShared {
    id: ObjectId,
    state: Mutex<FenceState>,
    signaled: Condvar,
}

impl FenceShared {
    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    /// Marks the fence as owned by a dispatch on `queue`.
    pub(crate) fn attach(&self, queue: ObjectId) -> HalResult<()> {
        let mut state = self.state.lock();
        if let FenceState::Pending { queue: owner } = *state {
            return Err(HalError::invalid(format!(
                "fence {} already has a pending dispatch on queue {owner}",
                self.id
            )));
        }
        *state = FenceState::Pending { queue };
        Ok(())
    }

    pub(crate) fn signal(&self, code: ResultCode) {
        let mut state = self.state.lock();
        if let FenceState::Pending { queue } = *state {
            *state = FenceState::Signaled { queue, code };
        }
        self.signaled.notify_all();
    }

    /// Waits for the dispatch on `queue` that owns the fence.
    ///
    /// `None` waits forever. A fence that was never attached reports
    /// `NotReady` straight away.
    pub(crate) fn wait(&self, queue: ObjectId, timeout: Option<Duration>) -> HalResult<FenceStatus> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = self.state.lock();
        loop {
            match *state {
                FenceState::Unsignaled => return Ok(FenceStatus::NotReady),
                FenceState::Pending { queue: owner } | FenceState::Signaled { queue: owner, .. }
                    if owner != queue =>
                {
                    return Err(HalError::invalid(format!(
                        "fence {} belongs to queue {owner}, not {queue}",
                        self.id
                    )));
                }
                FenceState::Signaled { code, .. } => {
                    return if code.is_success() {
                        Ok(FenceStatus::Signaled)
                    } else {
                        Err(HalError::FenceFailure(code))
                    };
                }
                FenceState::Pending { .. } => match (timeout, deadline) {
                    (Some(_), Some(deadline)) => {
                        if Instant::now() >= deadline {
                            return Ok(FenceStatus::NotReady);
                        }
                        self.signaled.wait_until(&mut state, deadline);
                    }
                    _ => self.signaled.wait(&mut state),
                },
            }
        }
    }

    fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), FenceState::Pending { .. })
    }

    fn code(&self) -> Option<ResultCode> {
        match *self.state.lock() {
            FenceState::Signaled { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// A fence.
#[derive(Debug)]
pub struct Fence {
    shared: Arc<FenceShared>,
    device: ObjectId,
    _charge: HostCharge,
}

impl Fence {
    pub(crate) fn new(id: ObjectId, device: ObjectId, charge: HostCharge) -> Self {
        Self {
            shared: Arc::new(FenceShared {
                id,
                state: Mutex::new(FenceState::Unsignaled),
                signaled: Condvar::new(),
            }),
            device,
            _charge: charge,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<FenceShared> {
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

    /// True while a dispatch owns the fence.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.shared.is_pending()
    }

    /// Result of the last dispatch that signaled the fence, if any.
    #[must_use]
    pub fn result(&self) -> Option<ResultCode> {
        self.shared.code()
    }

    /// Returns the fence to the unsignaled state for reuse.
    ///
    /// # Errors
    ///
    /// [`HalError::InvalidValue`] while a dispatch using the fence is pending.
    pub fn reset(&mut self) -> HalResult<()> {
        let mut state = self.shared.state.lock();
        if let FenceState::Pending { queue } = *state {
            return Err(HalError::invalid(format!(
                "fence {} is pending on queue {queue}",
                self.shared.id
            )));
        }
        *state = FenceState::Unsignaled;
        Ok(())
    }
}
