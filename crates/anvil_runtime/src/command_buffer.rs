//! # Command Buffers
//!
//! ```text
//!              record*            finalize             dispatch
//!   ┌────────────┐ ───────> ┌───────────┐ ───────> ┌────────────┐
//!   │ Recording  │          │ Finalized │          │ Dispatched │ ─┐ dispatch
//!   └────────────┘ <─────── └───────────┘          └────────────┘ <┘
//!         ^          reset                                │
//!         └───────────────────── reset ───────────────────┘
//! ```
//!
//! The command list lives behind an `Arc`. A dispatch takes a snapshot of
//! that `Arc`; descriptor updates go through `Arc::make_mut`, so a dispatch
//! already in flight keeps the arguments it was submitted with and only the
//! next dispatch sees the update.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anvil_core::{HalError, HalResult, HostCharge, HostMemory, ObjectId};

use crate::command::{
    BufferRegion, Command, CommandKind, HostLayout, NdRangeOptions, UserCallback,
};
use crate::descriptor::DescriptorInfo;
use crate::device::DeviceShared;
use crate::kernel::Kernel;
use crate::memory::{Buffer, Image, ImageRegion};
use crate::query::QueryPool;
use crate::sync_point::{resolve_wait_list, ExecutionPlan, OwnerKey, SyncPoint};

/// Diagnostic callback: `(message, data)`.
pub type MessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Lifecycle state of a command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    /// Commands may be recorded.
    Recording,
    /// The command list is frozen and may be dispatched.
    Finalized,
    /// Dispatched at least once since finalize.
    Dispatched,
}

#[derive(Clone, Debug)]
pub(crate) struct RecordedCommand {
    pub(crate) command: Command,
    /// Indices of the commands this one waits on.
    pub(crate) waits: Vec<u32>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Program {
    pub(crate) commands: Vec<RecordedCommand>,
    pub(crate) plan: ExecutionPlan,
}

/// What a queue takes from a command buffer when dispatching it.
pub(crate) struct DispatchSnapshot {
    pub(crate) command_buffer: ObjectId,
    pub(crate) program: Arc<Program>,
    pub(crate) message_callback: Option<MessageCallback>,
    pub(crate) in_flight: Arc<AtomicUsize>,
}

/// An ordered, recordable set of commands.
pub struct CommandBuffer {
    id: ObjectId,
    owner: OwnerKey,
    device: Arc<DeviceShared>,
    state: CommandBufferState,
    generation: u32,
    program: Arc<Program>,
    message_callback: Option<MessageCallback>,
    in_flight: Arc<AtomicUsize>,
    _charge: HostCharge,
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("commands", &self.program.commands.len())
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    pub(crate) fn new(
        id: ObjectId,
        device: Arc<DeviceShared>,
        message_callback: Option<MessageCallback>,
        charge: HostCharge,
    ) -> Self {
        Self {
            id,
            owner: OwnerKey::next(),
            device,
            state: CommandBufferState::Recording,
            generation: 0,
            program: Arc::new(Program::default()),
            message_callback,
            in_flight: Arc::new(AtomicUsize::new(0)),
            _charge: charge,
        }
    }

    /// Object id.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Id of the owning device.
    #[must_use]
    pub fn device_id(&self) -> ObjectId {
        self.device.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// Reset count; sync-points of older generations are rejected.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Number of recorded commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.program.commands.len()
    }

    /// True if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.program.commands.is_empty()
    }

    /// Kinds of the recorded commands, in command-id order.
    #[must_use]
    pub fn command_kinds(&self) -> Vec<CommandKind> {
        self.program
            .commands
            .iter()
            .map(|recorded| recorded.command.kind())
            .collect()
    }

    /// Number of dependency waves, once finalized.
    #[must_use]
    pub fn wave_count(&self) -> Option<usize> {
        match self.state {
            CommandBufferState::Recording => None,
            _ => Some(self.program.plan.waves().len()),
        }
    }

    /// Dispatches of this buffer that have not completed yet.
    #[must_use]
    pub fn pending_dispatches(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn require_recording(&self) -> HalResult<()> {
        if self.state == CommandBufferState::Recording {
            Ok(())
        } else {
            Err(HalError::invalid(format!(
                "command buffer {} is {:?}, not recording",
                self.id, self.state
            )))
        }
    }

    /// Validates the wait list, builds the command and appends it.
    ///
    /// Nothing is appended unless every check passes.
    fn record_with(
        &mut self,
        wait_list: &[SyncPoint],
        build: impl FnOnce(ObjectId) -> HalResult<Command>,
    ) -> HalResult<SyncPoint> {
        self.require_recording()?;
        let next = u32::try_from(self.program.commands.len())
            .map_err(|_| HalError::invalid("command buffer is full"))?;
        let waits = resolve_wait_list(self.owner, self.id, self.generation, next, wait_list)?;
        let command = build(self.device.id)?;

        tracing::debug!(
            "Recorded {:?} as command {} of {} (waits on {:?})",
            command.kind(),
            next,
            self.id,
            waits
        );
        Arc::make_mut(&mut self.program)
            .commands
            .push(RecordedCommand { command, waits });
        Ok(SyncPoint::new(self.owner, self.id, self.generation, next))
    }

    /// Reads `size` bytes at `offset` of `src` into `host` at `host_offset`.
    pub fn read_buffer(
        &mut self,
        src: &Buffer,
        offset: u64,
        host: &HostMemory,
        host_offset: u64,
        size: u64,
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        let region = BufferRegion::new(offset, host_offset, size);
        self.read_buffer_regions(src, host, &[region], wait_list)
    }

    /// Reads several regions of `src` into `host`. Region source offsets are
    /// in the buffer, destination offsets in host memory.
    pub fn read_buffer_regions(
        &mut self,
        src: &Buffer,
        host: &HostMemory,
        regions: &[BufferRegion],
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        self.record_with(wait_list, |device| {
            Command::read_buffer(device, src, host, regions)
        })
    }

    /// Writes `size` bytes of `host` at `host_offset` into `dst` at `offset`.
    pub fn write_buffer(
        &mut self,
        dst: &Buffer,
        offset: u64,
        host: &HostMemory,
        host_offset: u64,
        size: u64,
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        let region = BufferRegion::new(host_offset, offset, size);
        self.write_buffer_regions(dst, host, &[region], wait_list)
    }

    /// Writes several regions of `host` into `dst`. Region source offsets are
    /// in host memory, destination offsets in the buffer.
    pub fn write_buffer_regions(
        &mut self,
        dst: &Buffer,
        host: &HostMemory,
        regions: &[BufferRegion],
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        self.record_with(wait_list, |device| {
            Command::write_buffer(device, dst, host, regions)
        })
    }

    /// Copies `size` bytes between buffers.
    pub fn copy_buffer(
        &mut self,
        src: &Buffer,
        src_offset: u64,
        dst: &Buffer,
        dst_offset: u64,
        size: u64,
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        let region = BufferRegion::new(src_offset, dst_offset, size);
        self.copy_buffer_regions(src, dst, &[region], wait_list)
    }

    /// Copies several regions between buffers.
    pub fn copy_buffer_regions(
        &mut self,
        src: &Buffer,
        dst: &Buffer,
        regions: &[BufferRegion],
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        self.record_with(wait_list, |device| {
            Command::copy_buffer(device, src, dst, regions)
        })
    }

    /// Repeats `pattern` over `size` bytes of `dst` starting at `offset`.
    pub fn fill_buffer(
        &mut self,
        dst: &Buffer,
        offset: u64,
        size: u64,
        pattern: &[u8],
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        self.record_with(wait_list, |device| {
            Command::fill_buffer(device, dst, offset, size, pattern)
        })
    }

    /// Reads an image region into host memory.
    pub fn read_image(
        &mut self,
        src: &Image,
        region: ImageRegion,
        host: &HostMemory,
        layout: HostLayout,
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        self.record_with(wait_list, |device| {
            Command::read_image(device, src, region, host, layout)
        })
    }

    /// Writes host memory into an image region.
    pub fn write_image(
        &mut self,
        dst: &Image,
        region: ImageRegion,
        host: &HostMemory,
        layout: HostLayout,
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        self.record_with(wait_list, |device| {
            Command::write_image(device, dst, region, host, layout)
        })
    }

    /// Fills an image region with one texel value in the image's format.
    pub fn fill_image(
        &mut self,
        dst: &Image,
        texel: &[u8],
        region: ImageRegion,
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        self.record_with(wait_list, |device| {
            Command::fill_image(device, dst, region, texel)
        })
    }

    /// Copies texels between images.
    pub fn copy_image(
        &mut self,
        src: &Image,
        src_origin: [u64; 3],
        dst: &Image,
        dst_region: ImageRegion,
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        self.record_with(wait_list, |device| {
            Command::copy_image(device, src, src_origin, dst, dst_region)
        })
    }

    /// Copies an image region, tightly packed, into a buffer.
    pub fn copy_image_to_buffer(
        &mut self,
        src: &Image,
        region: ImageRegion,
        dst: &Buffer,
        dst_offset: u64,
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        self.record_with(wait_list, |device| {
            Command::copy_image_to_buffer(device, src, region, dst, dst_offset)
        })
    }

    /// Copies tightly packed texels from a buffer into an image region.
    pub fn copy_buffer_to_image(
        &mut self,
        src: &Buffer,
        src_offset: u64,
        dst: &Image,
        region: ImageRegion,
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        self.record_with(wait_list, |device| {
            Command::copy_buffer_to_image(device, src, src_offset, dst, region)
        })
    }

    /// Dispatches `kernel` over an ND-range.
    pub fn nd_range(
        &mut self,
        kernel: &Kernel,
        options: NdRangeOptions,
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        self.record_with(wait_list, |device| Command::nd_range(device, kernel, options))
    }

    /// Runs `callback` on the queue's worker when the command executes.
    pub fn user_callback(
        &mut self,
        callback: UserCallback,
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        self.record_with(wait_list, |_| Ok(Command::UserCallback(callback)))
    }

    /// Starts queries `index..index + count` of `pool`.
    pub fn begin_query(
        &mut self,
        pool: &QueryPool,
        index: u32,
        count: u32,
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        self.record_with(wait_list, |device| {
            Command::query(device, CommandKind::BeginQuery, pool, index, count)
        })
    }

    /// Ends queries `index..index + count` of `pool`.
    pub fn end_query(
        &mut self,
        pool: &QueryPool,
        index: u32,
        count: u32,
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        self.record_with(wait_list, |device| {
            Command::query(device, CommandKind::EndQuery, pool, index, count)
        })
    }

    /// Re-arms queries `index..index + count` of `pool`.
    pub fn reset_query_pool(
        &mut self,
        pool: &QueryPool,
        index: u32,
        count: u32,
        wait_list: &[SyncPoint],
    ) -> HalResult<SyncPoint> {
        self.record_with(wait_list, |device| {
            Command::query(device, CommandKind::ResetQueryPool, pool, index, count)
        })
    }

    /// Freezes the command list and plans its execution.
    ///
    /// # Errors
    ///
    /// [`HalError::InvalidValue`] unless the buffer is recording.
    pub fn finalize(&mut self) -> HalResult<()> {
        self.require_recording()?;
        let program = Arc::make_mut(&mut self.program);
        program.plan = ExecutionPlan::from_wait_lists(
            program.commands.iter().map(|recorded| recorded.waits.as_slice()),
        );
        self.state = CommandBufferState::Finalized;
        tracing::debug!(
            "Finalized {} with {} commands in {} waves",
            self.id,
            program.commands.len(),
            program.plan.waves().len()
        );
        Ok(())
    }

    /// Clears the command list and returns to recording. Every sync-point
    /// produced so far becomes invalid.
    ///
    /// Resetting while a dispatch of this buffer is still running is a
    /// caller error; the running dispatch keeps its own snapshot.
    pub fn reset(&mut self) {
        #[cfg(debug_assertions)]
        {
            let pending = self.in_flight.load(Ordering::Acquire);
            if pending > 0 {
                tracing::warn!(
                    "Command buffer {} reset with {} dispatches still in flight",
                    self.id,
                    pending
                );
            }
        }
        self.program = Arc::new(Program::default());
        self.generation = self.generation.wrapping_add(1);
        self.state = CommandBufferState::Recording;
        tracing::debug!("Reset {} to generation {}", self.id, self.generation);
    }

    /// Creates a finalized deep copy with a fresh identity.
    ///
    /// # Errors
    ///
    /// - [`HalError::FeatureUnsupported`] if the device cannot clone
    /// - [`HalError::InvalidValue`] if the buffer is not finalized
    pub fn try_clone(&self) -> HalResult<Self> {
        if !self.device.info.capabilities.command_buffer_clone {
            return Err(HalError::FeatureUnsupported("command buffer clone"));
        }
        if self.state == CommandBufferState::Recording {
            return Err(HalError::invalid(format!(
                "command buffer {} must be finalized before cloning",
                self.id
            )));
        }
        let id = self.device.ids.command_buffer.next();
        let charge = HostCharge::for_object::<Self>(&self.device.allocator)?;
        tracing::debug!("Cloned {} into {}", self.id, id);
        Ok(Self {
            id,
            owner: OwnerKey::next(),
            device: Arc::clone(&self.device),
            state: CommandBufferState::Finalized,
            generation: 0,
            program: Arc::new(Program::clone(&self.program)),
            message_callback: self.message_callback.clone(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            _charge: charge,
        })
    }

    /// Replaces arguments of the ND-range command `command_id` for every
    /// later dispatch.
    ///
    /// `arg_indices[i]` receives `descriptors[i]`. Either every replacement
    /// applies or none does.
    ///
    /// # Errors
    ///
    /// - [`HalError::FeatureUnsupported`] if the device cannot update
    ///   descriptors
    /// - [`HalError::InvalidValue`] for a recording buffer, a command id that
    ///   is not an ND-range, an index out of range, or a descriptor of the
    ///   wrong kind
    pub fn update_descriptors(
        &mut self,
        command_id: u32,
        arg_indices: &[usize],
        descriptors: Vec<DescriptorInfo>,
    ) -> HalResult<()> {
        if !self.device.info.capabilities.descriptor_updates {
            return Err(HalError::FeatureUnsupported("descriptor updates"));
        }
        if self.state == CommandBufferState::Recording {
            return Err(HalError::invalid(format!(
                "command buffer {} must be finalized before updating descriptors",
                self.id
            )));
        }
        if arg_indices.len() != descriptors.len() {
            return Err(HalError::invalid(format!(
                "{} argument indices for {} descriptors",
                arg_indices.len(),
                descriptors.len()
            )));
        }
        let mut command = self
            .program
            .commands
            .get(command_id as usize)
            .map(|recorded| recorded.command.clone())
            .ok_or_else(|| HalError::invalid(format!("no command {command_id} in {}", self.id)))?;
        let nd_range = command.nd_range_mut().ok_or_else(|| {
            HalError::invalid(format!("command {command_id} is not an ND-range"))
        })?;
        for (&index, descriptor) in arg_indices.iter().zip(descriptors) {
            nd_range.replace_descriptor(index, descriptor, self.device.id)?;
        }

        Arc::make_mut(&mut self.program).commands[command_id as usize].command = command;
        tracing::debug!(
            "Updated {} descriptors of command {} in {}",
            arg_indices.len(),
            command_id,
            self.id
        );
        Ok(())
    }

    pub(crate) fn check_dispatchable(&self) -> HalResult<()> {
        if self.state == CommandBufferState::Recording {
            return Err(HalError::invalid(format!(
                "command buffer {} is not finalized",
                self.id
            )));
        }
        Ok(())
    }

    pub(crate) fn mark_dispatched(&mut self) -> DispatchSnapshot {
        self.state = CommandBufferState::Dispatched;
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        DispatchSnapshot {
            command_buffer: self.id,
            program: Arc::clone(&self.program),
            message_callback: self.message_callback.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::memory::MemoryProperties;

    fn bound_buffer(device: &Device, size: u64) -> (crate::memory::Memory, Buffer) {
        let memory = device
            .allocate_memory(size, MemoryProperties::default(), 16)
            .unwrap();
        let mut buffer = device.create_buffer(size).unwrap();
        device.bind_buffer_memory(&mut buffer, &memory, 0).unwrap();
        (memory, buffer)
    }

    #[test]
    fn test_forward_reference_rejected_without_mutation() {
        let device = Device::host().unwrap();
        let (_memory, buffer) = bound_buffer(&device, 64);
        let mut command_buffer = device.create_command_buffer(None).unwrap();
        let first = command_buffer.fill_buffer(&buffer, 0, 64, &[1], &[]).unwrap();
        assert_eq!(first.command_id(), 0);

        let forward = SyncPoint::new(
            command_buffer.owner,
            command_buffer.id(),
            command_buffer.generation(),
            1,
        );
        let err = command_buffer
            .fill_buffer(&buffer, 0, 64, &[2], &[first, forward])
            .unwrap_err();
        assert!(matches!(err, HalError::InvalidValue(_)));
        assert_eq!(command_buffer.len(), 1);
    }

    #[test]
    fn test_record_after_finalize_rejected() {
        let device = Device::host().unwrap();
        let (_memory, buffer) = bound_buffer(&device, 64);
        let mut command_buffer = device.create_command_buffer(None).unwrap();
        command_buffer.fill_buffer(&buffer, 0, 64, &[1], &[]).unwrap();
        command_buffer.finalize().unwrap();

        assert!(command_buffer.fill_buffer(&buffer, 0, 64, &[1], &[]).is_err());
        assert!(command_buffer.finalize().is_err());
        assert_eq!(command_buffer.len(), 1);
        assert_eq!(command_buffer.state(), CommandBufferState::Finalized);
    }

    #[test]
    fn test_reset_invalidates_sync_points() {
        let device = Device::host().unwrap();
        let (_memory, buffer) = bound_buffer(&device, 64);
        let mut command_buffer = device.create_command_buffer(None).unwrap();
        let old = command_buffer.fill_buffer(&buffer, 0, 64, &[1], &[]).unwrap();
        command_buffer.finalize().unwrap();

        command_buffer.reset();
        assert_eq!(command_buffer.state(), CommandBufferState::Recording);
        assert!(command_buffer.is_empty());
        assert_eq!(command_buffer.generation(), 1);

        command_buffer.fill_buffer(&buffer, 0, 64, &[1], &[]).unwrap();
        let err = command_buffer
            .fill_buffer(&buffer, 0, 64, &[1], &[old])
            .unwrap_err();
        assert!(matches!(err, HalError::InvalidValue(_)));
        assert_eq!(command_buffer.len(), 1);
    }

    #[test]
    fn test_sync_point_from_other_buffer_rejected() {
        let device = Device::host().unwrap();
        let (_memory, buffer) = bound_buffer(&device, 64);
        let mut a = device.create_command_buffer(None).unwrap();
        let mut b = device.create_command_buffer(None).unwrap();
        let point = a.fill_buffer(&buffer, 0, 64, &[1], &[]).unwrap();
        b.fill_buffer(&buffer, 0, 64, &[1], &[]).unwrap();
        assert!(b.fill_buffer(&buffer, 0, 64, &[1], &[point]).is_err());
    }

    #[test]
    fn test_sync_point_from_other_device_rejected() {
        let first = Device::host().unwrap();
        let second = Device::host().unwrap();
        let (_ma, buffer_a) = bound_buffer(&first, 64);
        let (_mb, buffer_b) = bound_buffer(&second, 64);
        let mut a = first.create_command_buffer(None).unwrap();
        let mut b = second.create_command_buffer(None).unwrap();
        // both are the first command buffer of their device
        assert_eq!(a.id(), b.id());

        let point = a.fill_buffer(&buffer_a, 0, 64, &[1], &[]).unwrap();
        b.fill_buffer(&buffer_b, 0, 64, &[1], &[]).unwrap();
        let err = b
            .fill_buffer(&buffer_b, 0, 64, &[1], &[point])
            .unwrap_err();
        assert!(matches!(err, HalError::InvalidValue(_)));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_finalize_plans_waves() {
        let device = Device::host().unwrap();
        let (_memory, buffer) = bound_buffer(&device, 64);
        let mut command_buffer = device.create_command_buffer(None).unwrap();
        let a = command_buffer.fill_buffer(&buffer, 0, 32, &[1], &[]).unwrap();
        let b = command_buffer.fill_buffer(&buffer, 32, 32, &[2], &[]).unwrap();
        command_buffer
            .copy_buffer(&buffer, 0, &buffer, 32, 16, &[a, b, a])
            .unwrap();
        assert_eq!(command_buffer.wave_count(), None);
        command_buffer.finalize().unwrap();
        assert_eq!(command_buffer.wave_count(), Some(2));
        assert_eq!(
            command_buffer.command_kinds(),
            vec![CommandKind::FillBuffer, CommandKind::FillBuffer, CommandKind::CopyBuffer]
        );
    }

    #[test]
    fn test_clone_requires_finalized_buffer() {
        let device = Device::host().unwrap();
        let (_memory, buffer) = bound_buffer(&device, 64);
        let mut command_buffer = device.create_command_buffer(None).unwrap();
        command_buffer.fill_buffer(&buffer, 0, 64, &[1], &[]).unwrap();
        assert!(matches!(command_buffer.try_clone(), Err(HalError::InvalidValue(_))));

        command_buffer.finalize().unwrap();
        let copy = command_buffer.try_clone().unwrap();
        assert_ne!(copy.id(), command_buffer.id());
        assert_eq!(copy.state(), CommandBufferState::Finalized);
        assert_eq!(copy.command_kinds(), command_buffer.command_kinds());
        assert_eq!(copy.pending_dispatches(), 0);
    }

    #[test]
    fn test_update_descriptors_rejects_non_nd_range() {
        let device = Device::host().unwrap();
        let (_memory, buffer) = bound_buffer(&device, 64);
        let mut command_buffer = device.create_command_buffer(None).unwrap();
        command_buffer.fill_buffer(&buffer, 0, 64, &[1], &[]).unwrap();

        let descriptor = DescriptorInfo::buffer(&buffer).unwrap();
        assert!(command_buffer
            .update_descriptors(0, &[0], vec![descriptor.clone()])
            .is_err());
        command_buffer.finalize().unwrap();
        assert!(matches!(
            command_buffer.update_descriptors(0, &[0], vec![descriptor.clone()]),
            Err(HalError::InvalidValue(_))
        ));
        assert!(matches!(
            command_buffer.update_descriptors(7, &[0], vec![descriptor]),
            Err(HalError::InvalidValue(_))
        ));
    }
}
