//! # Sync-Points and the Command DAG
//!
//! A sync-point names one recorded command's completion inside its owning
//! command buffer. Wait lists may only reference earlier commands of the same
//! buffer generation, which keeps the dependency graph acyclic by
//! construction.
//!
//! At finalize the graph is cut into waves:
//!
//! ```text
//! cmd0 ─┐
//!       ├─> cmd2 ──> cmd3        wave 0: [cmd0, cmd1, cmd4]
//! cmd1 ─┘                        wave 1: [cmd2]
//! cmd4                           wave 2: [cmd3]
//! ```
//!
//! Every dependency of a wave-`n` command lives in a wave below `n`, so
//! commands of one wave may run concurrently.
//!
//! Object ids are per-device and wrap, so ownership is decided by an
//! [`OwnerKey`] that is unique for the life of the process.

use std::sync::atomic::{AtomicU64, Ordering};

use anvil_core::{HalError, HalResult, ObjectId, ObjectType};

static NEXT_OWNER_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct OwnerKey(u64);

impl OwnerKey {
    pub(crate) fn next() -> Self {
        Self(NEXT_OWNER_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

/// Completion of one command in one command-buffer generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SyncPoint {
    owner: OwnerKey,
    buffer: ObjectId,
    generation: u32,
    command: u32,
}

impl SyncPoint {
    pub(crate) const fn new(owner: OwnerKey, buffer: ObjectId, generation: u32, command: u32) -> Self {
        Self {
            owner,
            buffer,
            generation,
            command,
        }
    }

    /// Command buffer that produced the sync-point.
    #[must_use]
    pub const fn buffer_id(&self) -> ObjectId {
        self.buffer
    }

    /// Buffer generation the sync-point belongs to.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Index of the producing command within its buffer.
    #[must_use]
    pub const fn command_id(&self) -> u32 {
        self.command
    }

    /// Packed object id of the sync-point.
    #[must_use]
    pub const fn id(&self) -> ObjectId {
        ObjectId::new(ObjectType::SyncPoint, self.command)
    }
}

/// Validates a wait list for the command about to be recorded as `next`.
///
/// Returns the referenced command indices, sorted and deduplicated.
pub(crate) fn resolve_wait_list(
    owner: OwnerKey,
    buffer: ObjectId,
    generation: u32,
    next: u32,
    wait_list: &[SyncPoint],
) -> HalResult<Vec<u32>> {
    let mut indices = Vec::with_capacity(wait_list.len());
    for point in wait_list {
        if point.owner != owner {
            return Err(HalError::invalid(format!(
                "sync-point from another command buffer ({}) used in {buffer}",
                point.buffer
            )));
        }
        if point.generation != generation {
            return Err(HalError::invalid(format!(
                "sync-point of generation {} used after reset (now {generation})",
                point.generation
            )));
        }
        if point.command >= next {
            return Err(HalError::invalid(format!(
                "sync-point {} is not a forward reference from command {next}",
                point.command
            )));
        }
        indices.push(point.command);
    }
    indices.sort_unstable();
    indices.dedup();
    Ok(indices)
}

/// Commands grouped into waves of mutually independent work.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ExecutionPlan {
    waves: Vec<Vec<usize>>,
}

impl ExecutionPlan {
    /// Builds the plan from each command's wait list, in command order.
    ///
    /// Wait lists only reference lower indices, so one forward pass assigns
    /// every command its level.
    pub(crate) fn from_wait_lists<'a>(wait_lists: impl IntoIterator<Item = &'a [u32]>) -> Self {
        let mut levels: Vec<usize> = Vec::new();
        let mut waves: Vec<Vec<usize>> = Vec::new();
        for (index, waits) in wait_lists.into_iter().enumerate() {
            let level = waits
                .iter()
                .filter_map(|&dep| levels.get(dep as usize))
                .map(|&dep_level| dep_level + 1)
                .max()
                .unwrap_or(0);
            levels.push(level);
            if waves.len() <= level {
                waves.resize_with(level + 1, Vec::new);
            }
            waves[level].push(index);
        }
        Self { waves }
    }

    pub(crate) fn waves(&self) -> &[Vec<usize>] {
        &self.waves
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::ResultCode;

    fn buffer() -> ObjectId {
        ObjectId::new(ObjectType::CommandBuffer, 1)
    }

    fn point(owner: OwnerKey, generation: u32, command: u32) -> SyncPoint {
        SyncPoint::new(owner, buffer(), generation, command)
    }

    #[test]
    fn test_forward_references_only() {
        let owner = OwnerKey::next();
        let points = [point(owner, 0, 0), point(owner, 0, 2)];
        assert_eq!(resolve_wait_list(owner, buffer(), 0, 3, &points).unwrap(), vec![0, 2]);

        let err = resolve_wait_list(owner, buffer(), 0, 2, &points).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidValue);
    }

    #[test]
    fn test_stale_generation_rejected() {
        let owner = OwnerKey::next();
        let points = [point(owner, 0, 0)];
        assert!(resolve_wait_list(owner, buffer(), 1, 5, &points).is_err());
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let owner = OwnerKey::next();
        let other = ObjectId::new(ObjectType::CommandBuffer, 2);
        let points = [SyncPoint::new(OwnerKey::next(), other, 0, 0)];
        assert!(resolve_wait_list(owner, buffer(), 0, 5, &points).is_err());
    }

    #[test]
    fn test_same_object_id_different_owner_rejected() {
        // ids wrap per device; only the owner key tells the buffers apart
        let owner = OwnerKey::next();
        let points = [point(OwnerKey::next(), 0, 0)];
        let err = resolve_wait_list(owner, buffer(), 0, 5, &points).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidValue);
    }

    #[test]
    fn test_owner_keys_are_unique() {
        assert_ne!(OwnerKey::next(), OwnerKey::next());
    }

    #[test]
    fn test_duplicates_collapse() {
        let owner = OwnerKey::next();
        let sync = point(owner, 0, 1);
        assert_eq!(
            resolve_wait_list(owner, buffer(), 0, 4, &[sync, sync]).unwrap(),
            vec![1]
        );
    }

    #[test]
    fn test_waves_follow_levels() {
        let waits: Vec<Vec<u32>> = vec![vec![], vec![], vec![0, 1], vec![2], vec![]];
        let plan = ExecutionPlan::from_wait_lists(waits.iter().map(Vec::as_slice));
        assert_eq!(plan.waves(), &[vec![0, 1, 4], vec![2], vec![3]]);
    }

    #[test]
    fn test_sync_point_id_is_tagged() {
        let sync = point(OwnerKey::next(), 0, 7);
        assert!(sync.id().is(ObjectType::SyncPoint));
        assert_eq!(sync.id().serial(), 7);
    }
}
