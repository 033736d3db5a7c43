//! # Device Memory, Buffers and Images
//!
//! Memory is a block of device bytes carved out of the device's capacity.
//! Buffers and images are views that become usable once bound to a range of
//! a memory block. Commands capture the binding (not the object) at record
//! time, so the storage stays alive for as long as any command uses it.
//!
//! ## Layout
//!
//! ```text
//! Memory ─── [ .... | Buffer A | ..pad.. | Image B (linear rows) | .... ]
//!                   ^ offset % buffer_alignment == 0
//! ```
//!
//! Images use a linear layout: texels are packed along X, rows along Y and
//! slices along Z. Array layers occupy Y for 1D arrays and Z for 2D arrays.

use std::ops::Range;
use std::sync::Arc;

use anvil_core::{HalError, HalResult, HostCharge, ObjectId};
use parking_lot::{Mutex, RwLock};

/// Shared backing bytes of a memory block.
pub(crate) type Storage = Arc<RwLock<Vec<u8>>>;

/// Properties requested for a memory allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryProperties {
    /// The host may read and write the block directly.
    pub host_visible: bool,
    /// Host writes are visible to the device without an explicit flush.
    pub host_coherent: bool,
}

impl Default for MemoryProperties {
    fn default() -> Self {
        Self {
            host_visible: true,
            host_coherent: true,
        }
    }
}

impl MemoryProperties {
    /// Memory only the device touches.
    pub const DEVICE_ONLY: Self = Self {
        host_visible: false,
        host_coherent: false,
    };
}

/// Capacity accounting for one device.
#[derive(Debug)]
pub(crate) struct MemoryHeap {
    capacity: u64,
    used: Mutex<u64>,
}

impl MemoryHeap {
    pub(crate) fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: Mutex::new(0),
        }
    }

    pub(crate) fn reserve(&self, size: u64) -> HalResult<()> {
        let mut used = self.used.lock();
        let available = self.capacity - *used;
        if size > available {
            return Err(HalError::OutOfMemory {
                requested: size,
                available,
            });
        }
        *used += size;
        Ok(())
    }

    pub(crate) fn release(&self, size: u64) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(size);
    }

    pub(crate) fn used(&self) -> u64 {
        *self.used.lock()
    }
}

/// A device memory allocation.
#[derive(Debug)]
pub struct Memory {
    id: ObjectId,
    device: ObjectId,
    size: u64,
    alignment: u64,
    properties: MemoryProperties,
    storage: Storage,
    heap: Arc<MemoryHeap>,
    _charge: HostCharge,
}

impl Memory {
    pub(crate) fn new(
        id: ObjectId,
        device: ObjectId,
        size: u64,
        alignment: u64,
        properties: MemoryProperties,
        heap: Arc<MemoryHeap>,
        charge: HostCharge,
    ) -> Self {
        Self {
            id,
            device,
            size,
            alignment,
            properties,
            storage: Arc::new(RwLock::new(vec![0; size as usize])),
            heap,
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
        self.device
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Alignment the block was allocated with.
    #[must_use]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Properties the block was allocated with.
    #[must_use]
    pub fn properties(&self) -> MemoryProperties {
        self.properties
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn host_range(&self, offset: u64, len: usize) -> HalResult<Range<usize>> {
        if !self.properties.host_visible {
            return Err(HalError::invalid(format!(
                "memory {} is not host visible",
                self.id
            )));
        }
        byte_range(offset, len as u64, self.size, 0, "memory")
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        self.heap.release(self.size);
    }
}

/// A buffer's view of a memory range.
#[derive(Clone, Debug)]
pub(crate) struct BufferBinding {
    pub(crate) buffer: ObjectId,
    storage: Storage,
    offset: u64,
    size: u64,
}

impl BufferBinding {
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Absolute storage range for `len` bytes at buffer-relative `offset`.
    pub(crate) fn range(&self, offset: u64, len: u64) -> HalResult<Range<usize>> {
        byte_range(offset, len, self.size, self.offset, "buffer")
    }

    pub(crate) fn read(&self, offset: u64, len: u64) -> HalResult<Vec<u8>> {
        let range = self.range(offset, len)?;
        Ok(self.storage.read()[range].to_vec())
    }

    pub(crate) fn write(&self, offset: u64, data: &[u8]) -> HalResult<()> {
        let range = self.range(offset, data.len() as u64)?;
        self.storage.write()[range].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn fill(&self, offset: u64, size: u64, pattern: &[u8]) -> HalResult<()> {
        let range = self.range(offset, size)?;
        let mut storage = self.storage.write();
        for chunk in storage[range].chunks_mut(pattern.len()) {
            chunk.copy_from_slice(&pattern[..chunk.len()]);
        }
        Ok(())
    }

    /// True if both bindings view the same memory block.
    pub(crate) fn aliases(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }
}

/// A linear device buffer.
#[derive(Debug)]
pub struct Buffer {
    id: ObjectId,
    device: ObjectId,
    size: u64,
    binding: Option<BufferBinding>,
    _charge: HostCharge,
}

impl Buffer {
    pub(crate) fn new(id: ObjectId, device: ObjectId, size: u64, charge: HostCharge) -> Self {
        Self {
            id,
            device,
            size,
            binding: None,
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
        self.device
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// True once the buffer has been bound to memory.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub(crate) fn bind(&mut self, memory: &Memory, offset: u64) -> HalResult<()> {
        if self.binding.is_some() {
            return Err(HalError::invalid(format!("buffer {} is already bound", self.id)));
        }
        byte_range(offset, self.size, memory.size(), 0, "memory")?;
        self.binding = Some(BufferBinding {
            buffer: self.id,
            storage: Arc::clone(memory.storage()),
            offset,
            size: self.size,
        });
        Ok(())
    }

    pub(crate) fn binding(&self) -> HalResult<&BufferBinding> {
        self.binding
            .as_ref()
            .ok_or_else(|| HalError::invalid(format!("buffer {} is not bound to memory", self.id)))
    }
}

/// Texel formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// One 8-bit unsigned channel.
    R8Uint,
    /// Two 8-bit unsigned channels.
    Rg8Uint,
    /// Four 8-bit normalized channels.
    Rgba8Unorm,
    /// One 32-bit unsigned channel.
    R32Uint,
    /// One 32-bit float channel.
    R32Float,
    /// Four 32-bit float channels.
    Rgba32Float,
}

impl ImageFormat {
    /// Bytes per texel.
    #[must_use]
    pub const fn texel_size(self) -> u64 {
        match self {
            Self::R8Uint => 1,
            Self::Rg8Uint => 2,
            Self::Rgba8Unorm | Self::R32Uint | Self::R32Float => 4,
            Self::Rgba32Float => 16,
        }
    }
}

/// Image dimensionality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageType {
    /// One-dimensional.
    D1,
    /// Two-dimensional.
    D2,
    /// Three-dimensional.
    D3,
    /// Array of one-dimensional layers.
    D1Array,
    /// Array of two-dimensional layers.
    D2Array,
}

/// Creation parameters of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    /// Dimensionality.
    pub image_type: ImageType,
    /// Texel format.
    pub format: ImageFormat,
    /// Width, height and depth in texels. Unused dimensions are 1.
    pub extent: [u64; 3],
    /// Layer count for array types, 1 otherwise.
    pub array_layers: u64,
}

impl ImageDesc {
    /// A 2D image.
    #[must_use]
    pub const fn d2(format: ImageFormat, width: u64, height: u64) -> Self {
        Self {
            image_type: ImageType::D2,
            format,
            extent: [width, height, 1],
            array_layers: 1,
        }
    }

    /// Checks that unused dimensions are collapsed and nothing is empty.
    pub fn validate(&self) -> HalResult<()> {
        let [width, height, depth] = self.extent;
        if width == 0 || height == 0 || depth == 0 || self.array_layers == 0 {
            return Err(HalError::invalid("image dimensions must be non-zero"));
        }
        let ok = match self.image_type {
            ImageType::D1 => height == 1 && depth == 1 && self.array_layers == 1,
            ImageType::D2 => depth == 1 && self.array_layers == 1,
            ImageType::D3 => self.array_layers == 1,
            ImageType::D1Array => height == 1 && depth == 1,
            ImageType::D2Array => depth == 1,
        };
        if ok {
            Ok(())
        } else {
            Err(HalError::invalid(format!(
                "extent {:?} with {} layers does not fit a {:?} image",
                self.extent, self.array_layers, self.image_type
            )))
        }
    }

    /// Addressable extent, with array layers folded into Y or Z.
    #[must_use]
    pub const fn texel_extent(&self) -> [u64; 3] {
        let [width, height, depth] = self.extent;
        match self.image_type {
            ImageType::D1Array => [width, self.array_layers, 1],
            ImageType::D2Array => [width, height, self.array_layers],
            _ => [width, height, depth],
        }
    }

    /// Bytes per row.
    #[must_use]
    pub const fn row_pitch(&self) -> u64 {
        self.extent[0] * self.format.texel_size()
    }

    /// Bytes per slice.
    #[must_use]
    pub const fn slice_pitch(&self) -> u64 {
        self.row_pitch() * self.texel_extent()[1]
    }

    /// Total bytes of backing memory required.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.slice_pitch() * self.texel_extent()[2]
    }
}

/// A box of texels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageRegion {
    /// First texel.
    pub origin: [u64; 3],
    /// Texels per dimension.
    pub extent: [u64; 3],
}

impl ImageRegion {
    /// Region starting at `origin` with the given `extent`.
    #[must_use]
    pub const fn new(origin: [u64; 3], extent: [u64; 3]) -> Self {
        Self { origin, extent }
    }

    /// Region covering a whole image.
    #[must_use]
    pub const fn whole(desc: &ImageDesc) -> Self {
        Self {
            origin: [0; 3],
            extent: desc.texel_extent(),
        }
    }

    /// Number of texels in the region.
    #[must_use]
    pub const fn texel_count(&self) -> u64 {
        self.extent[0] * self.extent[1] * self.extent[2]
    }
}

/// An image's view of a memory range.
#[derive(Clone, Debug)]
pub(crate) struct ImageBinding {
    pub(crate) image: ObjectId,
    storage: Storage,
    offset: u64,
    desc: ImageDesc,
}

impl ImageBinding {
    pub(crate) fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub(crate) fn check_region(&self, region: &ImageRegion) -> HalResult<()> {
        let bounds = self.desc.texel_extent();
        for axis in 0..3 {
            let end = region.origin[axis].checked_add(region.extent[axis]);
            if region.extent[axis] == 0 || end.map_or(true, |end| end > bounds[axis]) {
                return Err(HalError::invalid(format!(
                    "region {region:?} exceeds image {} of extent {bounds:?}",
                    self.image
                )));
            }
        }
        Ok(())
    }

    /// Byte ranges of each row of `region`, in Z-major then Y order.
    fn rows(&self, region: &ImageRegion) -> impl Iterator<Item = Range<usize>> + '_ {
        let texel = self.desc.format.texel_size();
        let row_pitch = self.desc.row_pitch();
        let slice_pitch = self.desc.slice_pitch();
        let row_len = (region.extent[0] * texel) as usize;
        let [ox, oy, oz] = region.origin;
        let [_, ey, ez] = region.extent;
        let base = self.offset;
        (0..ez).flat_map(move |z| {
            (0..ey).map(move |y| {
                let start = base + (oz + z) * slice_pitch + (oy + y) * row_pitch + ox * texel;
                let start = start as usize;
                start..start + row_len
            })
        })
    }

    /// Copies a region out, tightly packed.
    pub(crate) fn read_region(&self, region: &ImageRegion) -> HalResult<Vec<u8>> {
        self.check_region(region)?;
        let storage = self.storage.read();
        let mut packed =
            Vec::with_capacity((region.texel_count() * self.desc.format.texel_size()) as usize);
        for row in self.rows(region) {
            packed.extend_from_slice(&storage[row]);
        }
        Ok(packed)
    }

    /// Copies tightly packed texels into a region.
    pub(crate) fn write_region(&self, region: &ImageRegion, packed: &[u8]) -> HalResult<()> {
        self.check_region(region)?;
        let expected = region.texel_count() * self.desc.format.texel_size();
        if packed.len() as u64 != expected {
            return Err(HalError::Internal(format!(
                "packed image data is {} bytes, region needs {expected}",
                packed.len()
            )));
        }
        let mut storage = self.storage.write();
        let mut cursor = 0;
        for row in self.rows(region) {
            let len = row.len();
            storage[row].copy_from_slice(&packed[cursor..cursor + len]);
            cursor += len;
        }
        Ok(())
    }

    pub(crate) fn fill_region(&self, region: &ImageRegion, texel: &[u8]) -> HalResult<()> {
        self.check_region(region)?;
        let mut storage = self.storage.write();
        for row in self.rows(region) {
            for chunk in storage[row].chunks_exact_mut(texel.len()) {
                chunk.copy_from_slice(texel);
            }
        }
        Ok(())
    }
}

/// A device image.
#[derive(Debug)]
pub struct Image {
    id: ObjectId,
    device: ObjectId,
    desc: ImageDesc,
    binding: Option<ImageBinding>,
    _charge: HostCharge,
}

impl Image {
    pub(crate) fn new(id: ObjectId, device: ObjectId, desc: ImageDesc, charge: HostCharge) -> Self {
        Self {
            id,
            device,
            desc,
            binding: None,
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
        self.device
    }

    /// Creation parameters.
    #[must_use]
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    /// Bytes of memory the image needs when bound.
    #[must_use]
    pub fn memory_size(&self) -> u64 {
        self.desc.size()
    }

    pub(crate) fn bind(&mut self, memory: &Memory, offset: u64) -> HalResult<()> {
        if self.binding.is_some() {
            return Err(HalError::invalid(format!("image {} is already bound", self.id)));
        }
        byte_range(offset, self.desc.size(), memory.size(), 0, "memory")?;
        self.binding = Some(ImageBinding {
            image: self.id,
            storage: Arc::clone(memory.storage()),
            offset,
            desc: self.desc,
        });
        Ok(())
    }

    pub(crate) fn binding(&self) -> HalResult<&ImageBinding> {
        self.binding
            .as_ref()
            .ok_or_else(|| HalError::invalid(format!("image {} is not bound to memory", self.id)))
    }
}

/// Out-of-range coordinate handling for samplers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum AddressingMode {
    /// Coordinates are assumed in range.
    #[default]
    None,
    /// Clamp to the edge texel.
    ClampToEdge,
    /// Clamp to a transparent border.
    Clamp,
    /// Wrap around.
    Repeat,
}

/// Texel filtering for samplers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    /// Nearest texel.
    #[default]
    Nearest,
    /// Linear interpolation.
    Linear,
}

/// Sampler state passed to kernels by value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct SamplerDesc {
    /// Out-of-range handling.
    pub addressing: AddressingMode,
    /// Filtering.
    pub filter: FilterMode,
    /// Coordinates are normalized to `0.0..1.0`.
    pub normalized_coords: bool,
}

/// Absolute range of `len` bytes at `offset` inside a `limit`-byte window
/// that starts at `base`.
fn byte_range(offset: u64, len: u64, limit: u64, base: u64, what: &str) -> HalResult<Range<usize>> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= limit)
        .ok_or_else(|| {
            HalError::invalid(format!(
                "range {offset}+{len} exceeds {what} of {limit} bytes"
            ))
        })?;
    Ok((base + offset) as usize..(base + end) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::{HostAllocator, ObjectType, ResultCode, SystemAllocator};

    fn charge() -> HostCharge {
        let allocator: Arc<dyn HostAllocator> = Arc::new(SystemAllocator::new());
        HostCharge::for_object::<u64>(&allocator).unwrap()
    }

    fn memory(size: u64) -> Memory {
        Memory::new(
            ObjectId::new(ObjectType::Memory, 0),
            ObjectId::new(ObjectType::Device, 0),
            size,
            16,
            MemoryProperties::default(),
            Arc::new(MemoryHeap::new(size)),
            charge(),
        )
    }

    #[test]
    fn test_heap_refuses_overcommit() {
        let heap = MemoryHeap::new(100);
        heap.reserve(60).unwrap();
        let err = heap.reserve(50).unwrap_err();
        assert_eq!(err.code(), ResultCode::OutOfMemory);
        heap.release(60);
        heap.reserve(100).unwrap();
        assert_eq!(heap.used(), 100);
    }

    #[test]
    fn test_buffer_binding_is_offset() {
        let memory = memory(64);
        let mut buffer = Buffer::new(ObjectId::new(ObjectType::Buffer, 0), memory.device_id(), 16, charge());
        buffer.bind(&memory, 32).unwrap();

        let binding = buffer.binding().unwrap();
        binding.write(4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(&memory.storage().read()[36..40], &[1, 2, 3, 4]);
        assert!(binding.write(14, &[0; 4]).is_err());
    }

    #[test]
    fn test_fill_repeats_pattern() {
        let memory = memory(32);
        let mut buffer = Buffer::new(ObjectId::new(ObjectType::Buffer, 0), memory.device_id(), 32, charge());
        buffer.bind(&memory, 0).unwrap();
        let binding = buffer.binding().unwrap();
        binding.fill(4, 8, &[0xAB, 0xCD]).unwrap();
        assert_eq!(binding.read(2, 12).unwrap(), vec![0, 0, 0xAB, 0xCD, 0xAB, 0xCD, 0xAB, 0xCD, 0xAB, 0xCD, 0, 0]);
    }

    #[test]
    fn test_bind_past_end_rejected() {
        let memory = memory(32);
        let mut buffer = Buffer::new(ObjectId::new(ObjectType::Buffer, 0), memory.device_id(), 32, charge());
        assert!(buffer.bind(&memory, 16).is_err());
        assert!(!buffer.is_bound());
    }

    #[test]
    fn test_image_region_rows() {
        let desc = ImageDesc::d2(ImageFormat::R8Uint, 4, 4);
        let memory = memory(desc.size());
        let mut image = Image::new(ObjectId::new(ObjectType::Image, 0), memory.device_id(), desc, charge());
        image.bind(&memory, 0).unwrap();
        let binding = image.binding().unwrap();

        let region = ImageRegion::new([1, 1, 0], [2, 2, 1]);
        binding.write_region(&region, &[1, 2, 3, 4]).unwrap();
        assert_eq!(binding.read_region(&region).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(
            memory.storage().read().clone(),
            vec![0, 0, 0, 0, 0, 1, 2, 0, 0, 3, 4, 0, 0, 0, 0, 0]
        );
        assert!(binding.check_region(&ImageRegion::new([3, 0, 0], [2, 1, 1])).is_err());
    }

    #[test]
    fn test_array_layers_fold_into_extent() {
        let desc = ImageDesc {
            image_type: ImageType::D2Array,
            format: ImageFormat::Rgba8Unorm,
            extent: [8, 4, 1],
            array_layers: 3,
        };
        desc.validate().unwrap();
        assert_eq!(desc.texel_extent(), [8, 4, 3]);
        assert_eq!(desc.size(), 8 * 4 * 4 * 3);

        let bad = ImageDesc {
            image_type: ImageType::D1,
            ..desc
        };
        assert!(bad.validate().is_err());
    }
}
