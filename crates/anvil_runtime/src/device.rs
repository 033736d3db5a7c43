//! # Devices
//!
//! A [`Device`] owns its queues, its memory heap, its kernel library and the
//! allocator every host-side object is charged to. All other objects are
//! created through it and destroyed through it.
//!
//! ## Lifetime
//!
//! Objects are plain owned values. `destroy_*` consumes the object after
//! checking it belongs to this device; dropping it has the same effect.
//! Dropping the device stops its queue workers after they drain.

use std::sync::Arc;

use anvil_core::{
    CounterDescription, DeviceInfo, HalError, HalResult, HostAllocator, HostCharge, IdAllocator,
    ObjectId, ObjectType, QueueType, SystemAllocator,
};

use crate::command::check_owner;
use crate::command_buffer::{CommandBuffer, MessageCallback};
use crate::fence::Fence;
use crate::kernel::{Executable, Kernel, KernelLibrary, KernelLimits};
use crate::memory::{Buffer, Image, ImageDesc, Memory, MemoryHeap, MemoryProperties};
use crate::query::{required_passes, QueryPool, QueryType};
use crate::queue::Queue;
use crate::semaphore::Semaphore;

static DEVICE_IDS: IdAllocator = IdAllocator::new(ObjectType::Device);

/// Per-device id allocators, one per object type.
#[derive(Debug)]
pub(crate) struct ObjectIds {
    pub(crate) buffer: IdAllocator,
    pub(crate) command_buffer: IdAllocator,
    pub(crate) executable: IdAllocator,
    pub(crate) image: IdAllocator,
    pub(crate) kernel: IdAllocator,
    pub(crate) memory: IdAllocator,
    pub(crate) queue: IdAllocator,
    pub(crate) semaphore: IdAllocator,
    pub(crate) query_pool: IdAllocator,
    pub(crate) fence: IdAllocator,
}

impl ObjectIds {
    const fn new() -> Self {
        Self {
            buffer: IdAllocator::new(ObjectType::Buffer),
            command_buffer: IdAllocator::new(ObjectType::CommandBuffer),
            executable: IdAllocator::new(ObjectType::Executable),
            image: IdAllocator::new(ObjectType::Image),
            kernel: IdAllocator::new(ObjectType::Kernel),
            memory: IdAllocator::new(ObjectType::Memory),
            queue: IdAllocator::new(ObjectType::Queue),
            semaphore: IdAllocator::new(ObjectType::Semaphore),
            query_pool: IdAllocator::new(ObjectType::QueryPool),
            fence: IdAllocator::new(ObjectType::Fence),
        }
    }
}

/// State shared between a device and the command buffers it created.
#[derive(Debug)]
pub(crate) struct DeviceShared {
    pub(crate) id: ObjectId,
    pub(crate) info: DeviceInfo,
    pub(crate) allocator: Arc<dyn HostAllocator>,
    pub(crate) ids: ObjectIds,
    pub(crate) heap: Arc<MemoryHeap>,
    pub(crate) library: KernelLibrary,
    pub(crate) limits: KernelLimits,
}

impl DeviceShared {
    fn charge<T>(&self) -> HalResult<HostCharge> {
        HostCharge::for_object::<T>(&self.allocator)
    }
}

/// A compute device.
#[derive(Debug)]
pub struct Device {
    shared: Arc<DeviceShared>,
    queues: Vec<Vec<Queue>>,
    _charge: HostCharge,
}

impl Device {
    /// Creates a device from its description.
    ///
    /// # Errors
    ///
    /// - [`HalError::MalformedDeviceEntry`] if `info` is inconsistent
    /// - [`HalError::OutOfMemory`] if `allocator` refuses the device record
    pub fn create(
        info: DeviceInfo,
        allocator: Arc<dyn HostAllocator>,
        library: KernelLibrary,
    ) -> HalResult<Self> {
        info.validate()?;
        let charge = HostCharge::for_object::<Self>(&allocator)?;
        let shared = Arc::new(DeviceShared {
            id: DEVICE_IDS.next(),
            heap: Arc::new(MemoryHeap::new(info.memory_capacity)),
            limits: KernelLimits::from_info(&info),
            info,
            allocator,
            ids: ObjectIds::new(),
            library,
        });

        let mut queues = Vec::with_capacity(QueueType::COUNT);
        for queue_type in QueueType::ALL {
            let count = shared.info.queue_count(queue_type);
            let mut of_type = Vec::with_capacity(count as usize);
            for index in 0..count {
                of_type.push(Queue::spawn(
                    shared.ids.queue.next(),
                    shared.id,
                    queue_type,
                    index,
                    shared.info.executor.clone(),
                )?);
            }
            queues.push(of_type);
        }

        tracing::info!(
            "Device {} '{}' created ({} compute queues, {} bytes)",
            shared.id,
            shared.info.name,
            shared.info.compute_queues,
            shared.info.memory_capacity
        );
        Ok(Self {
            shared,
            queues,
            _charge: charge,
        })
    }

    /// The built-in CPU device with the standard kernels.
    pub fn host() -> HalResult<Self> {
        Self::create(
            DeviceInfo::cpu(),
            Arc::new(SystemAllocator::new()),
            KernelLibrary::with_builtins(),
        )
    }

    /// Device id.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.shared.id
    }

    /// Capability record.
    #[must_use]
    pub fn info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    /// Queue `index` of `queue_type`.
    ///
    /// # Errors
    ///
    /// [`HalError::InvalidValue`] if the device has no such queue.
    pub fn queue(&self, queue_type: QueueType, index: u32) -> HalResult<&Queue> {
        self.queues[queue_type.index()]
            .get(index as usize)
            .ok_or_else(|| {
                HalError::invalid(format!(
                    "device {} has no {queue_type:?} queue {index}",
                    self.id()
                ))
            })
    }

    /// Number of queues of `queue_type`.
    #[must_use]
    pub fn queue_count(&self, queue_type: QueueType) -> u32 {
        self.queues[queue_type.index()].len() as u32
    }

    /// Bytes of device memory currently allocated.
    #[must_use]
    pub fn memory_used(&self) -> u64 {
        self.shared.heap.used()
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// Allocates `size` bytes of device memory.
    ///
    /// # Errors
    ///
    /// - [`HalError::InvalidValue`] for a zero size or an alignment that is
    ///   not a power of two
    /// - [`HalError::OutOfMemory`] if the device heap cannot hold `size`
    pub fn allocate_memory(
        &self,
        size: u64,
        properties: MemoryProperties,
        alignment: u64,
    ) -> HalResult<Memory> {
        if size == 0 {
            return Err(HalError::invalid("memory size must be non-zero"));
        }
        if !alignment.is_power_of_two() {
            return Err(HalError::invalid(format!(
                "alignment {alignment} is not a power of two"
            )));
        }
        if usize::try_from(size).is_err() {
            return Err(HalError::OutOfMemory {
                requested: size,
                available: self.shared.info.memory_capacity - self.memory_used(),
            });
        }
        let charge = self.shared.charge::<Memory>()?;
        self.shared.heap.reserve(size)?;
        let memory = Memory::new(
            self.shared.ids.memory.next(),
            self.id(),
            size,
            alignment,
            properties,
            Arc::clone(&self.shared.heap),
            charge,
        );
        tracing::debug!("Allocated {} bytes as memory {}", size, memory.id());
        Ok(memory)
    }

    /// Releases a memory allocation.
    ///
    /// Buffers bound to it keep the storage alive until they are destroyed,
    /// but the capacity is returned to the heap immediately.
    pub fn free_memory(&self, memory: Memory) -> HalResult<()> {
        check_owner(self.id(), memory.device_id(), "memory")
    }

    /// Writes `data` into host-visible memory at `offset`.
    pub fn write_memory(&self, memory: &Memory, offset: u64, data: &[u8]) -> HalResult<()> {
        check_owner(self.id(), memory.device_id(), "memory")?;
        let range = memory.host_range(offset, data.len())?;
        memory.storage().write()[range].copy_from_slice(data);
        Ok(())
    }

    /// Reads `len` bytes of host-visible memory at `offset`.
    pub fn read_memory(&self, memory: &Memory, offset: u64, len: usize) -> HalResult<Vec<u8>> {
        check_owner(self.id(), memory.device_id(), "memory")?;
        let range = memory.host_range(offset, len)?;
        Ok(memory.storage().read()[range].to_vec())
    }

    /// Creates an unbound buffer of `size` bytes.
    pub fn create_buffer(&self, size: u64) -> HalResult<Buffer> {
        if size == 0 {
            return Err(HalError::invalid("buffer size must be non-zero"));
        }
        let charge = self.shared.charge::<Buffer>()?;
        Ok(Buffer::new(self.shared.ids.buffer.next(), self.id(), size, charge))
    }

    /// Binds `buffer` to `memory` at `offset`.
    ///
    /// # Errors
    ///
    /// [`HalError::InvalidValue`] if `offset` is not a multiple of the
    /// device's buffer alignment, the range does not fit in `memory`, or the
    /// buffer is already bound.
    pub fn bind_buffer_memory(&self, buffer: &mut Buffer, memory: &Memory, offset: u64) -> HalResult<()> {
        check_owner(self.id(), buffer.device_id(), "buffer")?;
        check_owner(self.id(), memory.device_id(), "memory")?;
        self.check_binding_alignment(offset)?;
        buffer.bind(memory, offset)
    }

    /// Destroys a buffer.
    pub fn destroy_buffer(&self, buffer: Buffer) -> HalResult<()> {
        check_owner(self.id(), buffer.device_id(), "buffer")
    }

    /// Creates an unbound image.
    ///
    /// # Errors
    ///
    /// - [`HalError::FeatureUnsupported`] if the device has no image support
    /// - [`HalError::InvalidValue`] for an inconsistent description
    pub fn create_image(&self, desc: ImageDesc) -> HalResult<Image> {
        if !self.shared.info.capabilities.images {
            return Err(HalError::FeatureUnsupported("images"));
        }
        desc.validate()?;
        let charge = self.shared.charge::<Image>()?;
        Ok(Image::new(self.shared.ids.image.next(), self.id(), desc, charge))
    }

    /// Binds `image` to `memory` at `offset`.
    pub fn bind_image_memory(&self, image: &mut Image, memory: &Memory, offset: u64) -> HalResult<()> {
        check_owner(self.id(), image.device_id(), "image")?;
        check_owner(self.id(), memory.device_id(), "memory")?;
        self.check_binding_alignment(offset)?;
        image.bind(memory, offset)
    }

    /// Destroys an image.
    pub fn destroy_image(&self, image: Image) -> HalResult<()> {
        check_owner(self.id(), image.device_id(), "image")
    }

    fn check_binding_alignment(&self, offset: u64) -> HalResult<()> {
        let alignment = self.shared.info.buffer_alignment;
        if offset % alignment != 0 {
            return Err(HalError::invalid(format!(
                "binding offset {offset} is not aligned to {alignment}"
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Command buffers and synchronization
    // =========================================================================

    /// Creates a command buffer in the recording state.
    pub fn create_command_buffer(&self, message_callback: Option<MessageCallback>) -> HalResult<CommandBuffer> {
        let charge = self.shared.charge::<CommandBuffer>()?;
        let command_buffer = CommandBuffer::new(
            self.shared.ids.command_buffer.next(),
            Arc::clone(&self.shared),
            message_callback,
            charge,
        );
        tracing::debug!("Created command buffer {}", command_buffer.id());
        Ok(command_buffer)
    }

    /// Destroys a command buffer. Dispatches already submitted still run.
    pub fn destroy_command_buffer(&self, command_buffer: CommandBuffer) -> HalResult<()> {
        check_owner(self.id(), command_buffer.device_id(), "command buffer")
    }

    /// Creates an unsignaled fence.
    pub fn create_fence(&self) -> HalResult<Fence> {
        let charge = self.shared.charge::<Fence>()?;
        Ok(Fence::new(self.shared.ids.fence.next(), self.id(), charge))
    }

    /// Destroys a fence.
    pub fn destroy_fence(&self, fence: Fence) -> HalResult<()> {
        check_owner(self.id(), fence.device_id(), "fence")
    }

    /// Creates an unsignaled semaphore.
    pub fn create_semaphore(&self) -> HalResult<Semaphore> {
        let charge = self.shared.charge::<Semaphore>()?;
        Ok(Semaphore::new(self.shared.ids.semaphore.next(), self.id(), charge))
    }

    /// Destroys a semaphore.
    pub fn destroy_semaphore(&self, semaphore: Semaphore) -> HalResult<()> {
        check_owner(self.id(), semaphore.device_id(), "semaphore")
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Counters available to counter pools on `queue_type` queues.
    #[must_use]
    pub fn query_counters(&self, _queue_type: QueueType) -> &[CounterDescription] {
        &self.shared.info.query_counters
    }

    /// Passes needed to sample `counter_uuids` on `queue`.
    pub fn query_pool_required_passes(&self, queue: &Queue, counter_uuids: &[u32]) -> HalResult<u32> {
        check_owner(self.id(), queue.device_id(), "queue")?;
        required_passes(&self.shared.info, counter_uuids)
    }

    /// Creates a query pool of `slot_count` slots for `queue`.
    ///
    /// Counter pools take one counter uuid per slot.
    pub fn create_query_pool(
        &self,
        queue: &Queue,
        query_type: QueryType,
        slot_count: u32,
        counter_uuids: &[u32],
    ) -> HalResult<QueryPool> {
        check_owner(self.id(), queue.device_id(), "queue")?;
        let charge = self.shared.charge::<QueryPool>()?;
        QueryPool::new(
            self.shared.ids.query_pool.next(),
            self.id(),
            queue.id(),
            &self.shared.info,
            query_type,
            slot_count,
            counter_uuids,
            charge,
        )
    }

    /// Destroys a query pool.
    pub fn destroy_query_pool(&self, pool: QueryPool) -> HalResult<()> {
        check_owner(self.id(), pool.device_id(), "query pool")
    }

    // =========================================================================
    // Kernels
    // =========================================================================

    /// Loads an executable binary.
    ///
    /// # Errors
    ///
    /// - [`HalError::InvalidBinary`] for malformed data
    /// - [`HalError::MissingKernel`] if an entry is not in the device library
    pub fn create_executable(&self, binary: &[u8]) -> HalResult<Executable> {
        let charge = self.shared.charge::<Executable>()?;
        let executable = Executable::load(
            self.shared.ids.executable.next(),
            self.id(),
            binary,
            &self.shared.library,
            charge,
        )?;
        tracing::debug!(
            "Loaded executable {} with {} entries",
            executable.id(),
            executable.entries().len()
        );
        Ok(executable)
    }

    /// Destroys an executable. Kernels created from it stay valid.
    pub fn destroy_executable(&self, executable: Executable) -> HalResult<()> {
        check_owner(self.id(), executable.device_id(), "executable")
    }

    /// Creates the kernel `name` from `executable`.
    ///
    /// # Errors
    ///
    /// [`HalError::MissingKernel`] if the executable has no such entry.
    pub fn create_kernel(&self, executable: &Executable, name: &str) -> HalResult<Kernel> {
        check_owner(self.id(), executable.device_id(), "executable")?;
        if !executable.entries().iter().any(|entry| entry == name) {
            return Err(HalError::MissingKernel(name.to_string()));
        }
        self.kernel_from_library(name, false)
    }

    /// Creates a backend-provided kernel by name.
    ///
    /// # Errors
    ///
    /// - [`HalError::FeatureUnsupported`] if the device has no built-in kernels
    /// - [`HalError::MissingKernel`] for an unknown name
    pub fn create_built_in_kernel(&self, name: &str) -> HalResult<Kernel> {
        if !self.shared.info.capabilities.builtin_kernels {
            return Err(HalError::FeatureUnsupported("built-in kernels"));
        }
        self.kernel_from_library(name, true)
    }

    /// Destroys a kernel. Recorded commands keep using it.
    pub fn destroy_kernel(&self, kernel: Kernel) -> HalResult<()> {
        check_owner(self.id(), kernel.device_id(), "kernel")
    }

    fn kernel_from_library(&self, name: &str, builtin: bool) -> HalResult<Kernel> {
        let charge = self.shared.charge::<Kernel>()?;
        Kernel::from_library(
            self.shared.ids.kernel.next(),
            self.id(),
            name,
            builtin,
            &self.shared.library,
            self.shared.limits,
            charge,
        )
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::info!("Device {} '{}' shutting down", self.shared.id, self.shared.info.name);
        // queue workers drain and join here
        self.queues.clear();
    }
}

/// Creates one device per description, all charged to `allocator`.
///
/// # Errors
///
/// Fails on the first description that cannot be turned into a device.
pub fn create_devices(
    infos: &[DeviceInfo],
    allocator: &Arc<dyn HostAllocator>,
    library: &KernelLibrary,
) -> HalResult<Vec<Device>> {
    infos
        .iter()
        .map(|info| Device::create(info.clone(), Arc::clone(allocator), library.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::{AllocFn, CallbackAllocator, FreeFn};

    #[test]
    fn test_host_device_has_compute_queue() {
        let device = Device::host().unwrap();
        assert!(device.id().is(ObjectType::Device));
        assert_eq!(device.queue_count(QueueType::Compute), 1);
        let queue = device.queue(QueueType::Compute, 0).unwrap();
        assert!(queue.id().is(ObjectType::Queue));
        assert_eq!(queue.device_id(), device.id());
        assert!(device.queue(QueueType::Compute, 1).is_err());
    }

    #[test]
    fn test_memory_capacity_is_accounted() {
        let mut info = DeviceInfo::cpu();
        info.memory_capacity = 1024;
        let device = Device::create(info, Arc::new(SystemAllocator::new()), KernelLibrary::new()).unwrap();

        let first = device.allocate_memory(768, MemoryProperties::default(), 16).unwrap();
        assert_eq!(device.memory_used(), 768);
        let err = device
            .allocate_memory(512, MemoryProperties::default(), 16)
            .unwrap_err();
        assert_eq!(
            err,
            HalError::OutOfMemory {
                requested: 512,
                available: 256
            }
        );

        device.free_memory(first).unwrap();
        assert_eq!(device.memory_used(), 0);
        assert!(device.allocate_memory(512, MemoryProperties::default(), 16).is_ok());
    }

    #[test]
    fn test_allocate_rejects_bad_arguments() {
        let device = Device::host().unwrap();
        assert!(matches!(
            device.allocate_memory(0, MemoryProperties::default(), 16),
            Err(HalError::InvalidValue(_))
        ));
        assert!(matches!(
            device.allocate_memory(64, MemoryProperties::default(), 12),
            Err(HalError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_host_access_requires_visibility() {
        let device = Device::host().unwrap();
        let visible = device.allocate_memory(64, MemoryProperties::default(), 16).unwrap();
        device.write_memory(&visible, 8, &[1, 2, 3]).unwrap();
        assert_eq!(device.read_memory(&visible, 8, 3).unwrap(), vec![1, 2, 3]);
        assert!(device.read_memory(&visible, 62, 3).is_err());

        let hidden = device
            .allocate_memory(64, MemoryProperties::DEVICE_ONLY, 16)
            .unwrap();
        assert!(matches!(
            device.write_memory(&hidden, 0, &[1]),
            Err(HalError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_bind_checks_alignment() {
        let device = Device::host().unwrap();
        let memory = device.allocate_memory(256, MemoryProperties::default(), 16).unwrap();
        let mut buffer = device.create_buffer(64).unwrap();
        assert!(device.bind_buffer_memory(&mut buffer, &memory, 8).is_err());
        assert!(!buffer.is_bound());
        device.bind_buffer_memory(&mut buffer, &memory, 32).unwrap();
        assert!(buffer.is_bound());
        assert!(device.bind_buffer_memory(&mut buffer, &memory, 0).is_err());
    }

    #[test]
    fn test_foreign_objects_rejected() {
        let a = Device::host().unwrap();
        let b = Device::host().unwrap();
        let buffer = b.create_buffer(16).unwrap();
        assert!(matches!(a.destroy_buffer(buffer), Err(HalError::InvalidValue(_))));
        let fence = b.create_fence().unwrap();
        assert!(a.destroy_fence(fence).is_err());
    }

    #[test]
    fn test_builtin_kernels_gated_by_capability() {
        let device = Device::host().unwrap();
        let kernel = device.create_built_in_kernel("fill_u32").unwrap();
        assert_eq!(kernel.name(), "fill_u32");
        assert!(matches!(
            device.create_built_in_kernel("no_such_kernel"),
            Err(HalError::MissingKernel(_))
        ));

        let mut info = DeviceInfo::cpu();
        info.capabilities.builtin_kernels = false;
        let device = Device::create(info, Arc::new(SystemAllocator::new()), KernelLibrary::with_builtins()).unwrap();
        assert_eq!(
            device.create_built_in_kernel("fill_u32").unwrap_err(),
            HalError::FeatureUnsupported("built-in kernels")
        );
    }

    #[test]
    fn test_images_gated_by_capability() {
        let mut info = DeviceInfo::cpu();
        info.capabilities.images = false;
        let device = Device::create(info, Arc::new(SystemAllocator::new()), KernelLibrary::new()).unwrap();
        let desc = ImageDesc::d2(crate::memory::ImageFormat::R8Uint, 4, 4);
        assert!(matches!(
            device.create_image(desc),
            Err(HalError::FeatureUnsupported(_))
        ));
    }

    #[test]
    fn test_refusing_allocator_reports_out_of_memory() {
        let alloc: AllocFn = Arc::new(|_: usize, _: usize| None::<u64>);
        let free: FreeFn = Arc::new(|_: u64| {});
        let allocator: Arc<dyn HostAllocator> =
            Arc::new(CallbackAllocator::new(Some(alloc), Some(free)).unwrap());
        let result = Device::create(DeviceInfo::cpu(), allocator, KernelLibrary::new());
        assert!(matches!(result, Err(HalError::OutOfMemory { .. })));
    }

    #[test]
    fn test_create_devices_one_per_info() {
        let allocator: Arc<dyn HostAllocator> = Arc::new(SystemAllocator::new());
        let mut second = DeviceInfo::cpu();
        second.name = "second".to_string();
        second.compute_queues = 2;
        let devices = create_devices(&[DeviceInfo::cpu(), second], &allocator, &KernelLibrary::new()).unwrap();
        assert_eq!(devices.len(), 2);
        assert_ne!(devices[0].id(), devices[1].id());
        assert_eq!(devices[1].queue_count(QueueType::Compute), 2);
    }
}
