//! # Commands
//!
//! Every command a buffer can hold, validated when it is built and executed
//! by a queue worker. Validation happens up front so that a command that
//! made it into a buffer can only fail at execution time for reasons outside
//! the recorder's control (a failing kernel, a query ended before it began).
//!
//! | Command             | Reads            | Writes           |
//! |---------------------|------------------|------------------|
//! | `ReadBuffer`        | buffer           | host memory      |
//! | `WriteBuffer`       | host memory      | buffer           |
//! | `CopyBuffer`        | buffer           | buffer           |
//! | `FillBuffer`        | pattern          | buffer           |
//! | `ReadImage`         | image            | host memory      |
//! | `WriteImage`        | host memory      | image            |
//! | `FillImage`         | texel            | image            |
//! | `CopyImage`         | image            | image            |
//! | `CopyImageToBuffer` | image            | buffer           |
//! | `CopyBufferToImage` | buffer           | image            |
//! | `NdRange`           | kernel arguments | kernel arguments |
//! | `UserCallback`      | -                | -                |
//! | query commands      | queue counters   | query pool       |

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use anvil_core::{HalError, HalResult, HostMemory, ObjectId};

use crate::descriptor::DescriptorInfo;
use crate::kernel::{Kernel, KernelArgs, KernelShared, WorkItem};
use crate::memory::{Buffer, BufferBinding, Image, ImageBinding, ImageRegion};
use crate::query::{QueryPool, QueryPoolShared, QueueCounters};

/// Largest fill pattern in bytes.
pub const MAX_FILL_PATTERN_SIZE: usize = 128;

/// One contiguous span of a copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferRegion {
    /// Offset in the source.
    pub src_offset: u64,
    /// Offset in the destination.
    pub dst_offset: u64,
    /// Bytes to copy.
    pub size: u64,
}

impl BufferRegion {
    /// Creates a region.
    #[must_use]
    pub const fn new(src_offset: u64, dst_offset: u64, size: u64) -> Self {
        Self {
            src_offset,
            dst_offset,
            size,
        }
    }
}

/// Placement of image texels in host memory.
///
/// A zero pitch means tightly packed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct HostLayout {
    /// Byte offset of the first texel.
    pub offset: u64,
    /// Bytes between rows.
    pub row_pitch: u64,
    /// Bytes between slices.
    pub slice_pitch: u64,
}

impl HostLayout {
    /// Tightly packed rows starting at `offset`.
    #[must_use]
    pub const fn packed(offset: u64) -> Self {
        Self {
            offset,
            row_pitch: 0,
            slice_pitch: 0,
        }
    }

    /// Resolves zero pitches and checks the layout fits `host_len` bytes.
    fn resolve(&self, region: &ImageRegion, texel_size: u64, host_len: usize) -> HalResult<Self> {
        let overflow = || HalError::invalid("host layout overflows the address space");
        let [width, rows, slices] = region.extent;
        if width == 0 || rows == 0 || slices == 0 {
            return Err(HalError::invalid("image region extent must be non-zero"));
        }
        let row_len = width.checked_mul(texel_size).ok_or_else(overflow)?;
        let row_pitch = if self.row_pitch == 0 { row_len } else { self.row_pitch };
        let slice_len = row_pitch.checked_mul(rows).ok_or_else(overflow)?;
        let slice_pitch = if self.slice_pitch == 0 { slice_len } else { self.slice_pitch };
        if row_pitch < row_len || slice_pitch < slice_len {
            return Err(HalError::invalid(format!(
                "host pitches {row_pitch}/{slice_pitch} are smaller than the region"
            )));
        }
        let end = (slices - 1)
            .checked_mul(slice_pitch)
            .and_then(|last_slice| {
                (rows - 1)
                    .checked_mul(row_pitch)
                    .and_then(|last_row| last_slice.checked_add(last_row))
            })
            .and_then(|last| last.checked_add(row_len))
            .and_then(|last| last.checked_add(self.offset))
            .ok_or_else(overflow)?;
        if end > host_len as u64 {
            return Err(HalError::invalid(format!(
                "image region needs {end} host bytes, host memory has {host_len}"
            )));
        }
        Ok(Self {
            offset: self.offset,
            row_pitch,
            slice_pitch,
        })
    }

    /// Host byte ranges of each row of `region`, in the same order as the
    /// packed image rows.
    fn row_ranges(&self, region: &ImageRegion, row_len: usize) -> HalResult<Vec<Range<usize>>> {
        let [_, rows, slices] = region.extent;
        let mut ranges = Vec::with_capacity((rows * slices) as usize);
        for z in 0..slices {
            for y in 0..rows {
                let start = z
                    .checked_mul(self.slice_pitch)
                    .and_then(|slice| y.checked_mul(self.row_pitch).and_then(|row| slice.checked_add(row)))
                    .and_then(|delta| delta.checked_add(self.offset))
                    .and_then(|start| usize::try_from(start).ok())
                    .ok_or_else(|| HalError::invalid("host row offset overflows"))?;
                let end = start
                    .checked_add(row_len)
                    .ok_or_else(|| HalError::invalid("host row offset overflows"))?;
                ranges.push(start..end);
            }
        }
        Ok(ranges)
    }
}

/// Arguments passed to a user callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallbackContext {
    /// Queue executing the command.
    pub queue: ObjectId,
    /// Command buffer holding the command.
    pub command_buffer: ObjectId,
    /// Index of the callback command.
    pub command_id: u32,
}

/// Host function run as a command.
pub type UserCallback = Arc<dyn Fn(&CallbackContext) + Send + Sync>;

/// Launch parameters of an ND-range command.
#[derive(Clone, Debug)]
pub struct NdRangeOptions {
    /// Kernel arguments, in order.
    pub descriptors: Vec<DescriptorInfo>,
    /// Work-group size per dimension.
    pub local_size: [usize; 3],
    /// Offset added to every global id.
    pub global_offset: [usize; 3],
    /// Global size per dimension.
    pub global_size: [usize; 3],
    /// Dimensions in use.
    pub dimensions: usize,
}

impl NdRangeOptions {
    /// Options for a range of `global_size`, one entry per dimension, with a
    /// local size of one.
    #[must_use]
    pub fn new(global_size: &[usize]) -> Self {
        Self {
            descriptors: Vec::new(),
            local_size: [1; 3],
            global_offset: [0; 3],
            global_size: pad(global_size, 1),
            dimensions: global_size.len(),
        }
    }

    /// Sets the work-group size.
    #[must_use]
    pub fn local_size(mut self, local_size: &[usize]) -> Self {
        self.local_size = pad(local_size, 1);
        self
    }

    /// Sets the global offset.
    #[must_use]
    pub fn global_offset(mut self, offset: &[usize]) -> Self {
        self.global_offset = pad(offset, 0);
        self
    }

    /// Appends one kernel argument.
    #[must_use]
    pub fn descriptor(mut self, descriptor: DescriptorInfo) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Total number of work items.
    #[must_use]
    pub fn work_items(&self) -> u64 {
        self.global_size.iter().map(|&size| size as u64).product()
    }

    fn validate(&self, kernel: &KernelShared, device: ObjectId) -> HalResult<()> {
        if !(1..=3).contains(&self.dimensions) {
            return Err(HalError::invalid(format!(
                "ND-range must have 1 to 3 dimensions, got {}",
                self.dimensions
            )));
        }
        kernel.limits.check_local_size(self.local_size)?;
        if let Some(required) = kernel.properties.required_local_size {
            if required != self.local_size {
                return Err(HalError::invalid(format!(
                    "kernel {} requires local size {required:?}, got {:?}",
                    kernel.name, self.local_size
                )));
            }
        }
        for axis in 0..3 {
            let (global, local) = (self.global_size[axis], self.local_size[axis]);
            if global == 0 || global % local != 0 {
                return Err(HalError::invalid(format!(
                    "global size {global} is not a non-zero multiple of local size {local} in dimension {axis}"
                )));
            }
        }
        for (index, descriptor) in self.descriptors.iter().enumerate() {
            if let Some(owner) = descriptor.device() {
                check_owner(device, owner, &format!("descriptor {index}"))?;
            }
        }
        Ok(())
    }
}

fn pad(values: &[usize], fill: usize) -> [usize; 3] {
    let mut out = [fill; 3];
    for (slot, &value) in out.iter_mut().zip(values) {
        *slot = value;
    }
    out
}

/// Discriminant of a recorded command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Buffer to host.
    ReadBuffer,
    /// Host to buffer.
    WriteBuffer,
    /// Buffer to buffer.
    CopyBuffer,
    /// Pattern fill of a buffer.
    FillBuffer,
    /// Image to host.
    ReadImage,
    /// Host to image.
    WriteImage,
    /// Texel fill of an image.
    FillImage,
    /// Image to image.
    CopyImage,
    /// Image to buffer.
    CopyImageToBuffer,
    /// Buffer to image.
    CopyBufferToImage,
    /// Kernel dispatch.
    NdRange,
    /// Host callback.
    UserCallback,
    /// Query region start.
    BeginQuery,
    /// Query region end.
    EndQuery,
    /// Query slot reset.
    ResetQueryPool,
}

#[derive(Clone, Debug)]
pub(crate) struct NdRangeCommand {
    kernel: Arc<KernelShared>,
    pub(crate) options: NdRangeOptions,
}

/// A validated command.
#[derive(Clone)]
pub(crate) enum Command {
    ReadBuffer {
        src: BufferBinding,
        host: HostMemory,
        regions: Vec<BufferRegion>,
    },
    WriteBuffer {
        dst: BufferBinding,
        host: HostMemory,
        regions: Vec<BufferRegion>,
    },
    CopyBuffer {
        src: BufferBinding,
        dst: BufferBinding,
        regions: Vec<BufferRegion>,
    },
    FillBuffer {
        dst: BufferBinding,
        offset: u64,
        size: u64,
        pattern: Vec<u8>,
    },
    ReadImage {
        src: ImageBinding,
        region: ImageRegion,
        host: HostMemory,
        layout: HostLayout,
    },
    WriteImage {
        dst: ImageBinding,
        region: ImageRegion,
        host: HostMemory,
        layout: HostLayout,
    },
    FillImage {
        dst: ImageBinding,
        region: ImageRegion,
        texel: Vec<u8>,
    },
    CopyImage {
        src: ImageBinding,
        src_origin: [u64; 3],
        dst: ImageBinding,
        dst_region: ImageRegion,
    },
    CopyImageToBuffer {
        src: ImageBinding,
        region: ImageRegion,
        dst: BufferBinding,
        dst_offset: u64,
    },
    CopyBufferToImage {
        src: BufferBinding,
        src_offset: u64,
        dst: ImageBinding,
        region: ImageRegion,
    },
    NdRange(NdRangeCommand),
    UserCallback(UserCallback),
    BeginQuery {
        pool: Arc<QueryPoolShared>,
        index: u32,
        count: u32,
    },
    EndQuery {
        pool: Arc<QueryPoolShared>,
        index: u32,
        count: u32,
    },
    ResetQueryPool {
        pool: Arc<QueryPoolShared>,
        index: u32,
        count: u32,
    },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind())
    }
}

/// What a command needs from the queue running it.
pub(crate) struct ExecContext<'a> {
    pub(crate) queue: ObjectId,
    pub(crate) command_buffer: ObjectId,
    pub(crate) counters: &'a QueueCounters,
}

pub(crate) fn check_owner(device: ObjectId, owner: ObjectId, what: &str) -> HalResult<()> {
    if device == owner {
        Ok(())
    } else {
        Err(HalError::invalid(format!(
            "{what} belongs to device {owner}, not {device}"
        )))
    }
}

fn check_regions(regions: &[BufferRegion]) -> HalResult<()> {
    if regions.is_empty() {
        return Err(HalError::invalid("at least one region is required"));
    }
    if regions.iter().any(|region| region.size == 0) {
        return Err(HalError::invalid("regions must be non-empty"));
    }
    Ok(())
}

fn host_range_ok(host: &HostMemory, offset: u64, size: u64) -> HalResult<()> {
    let end = offset.checked_add(size);
    if end.map_or(true, |end| end > host.len() as u64) {
        return Err(HalError::invalid(format!(
            "host range {offset}+{size} exceeds host memory of {} bytes",
            host.len()
        )));
    }
    Ok(())
}

fn overlaps(a_start: usize, a_len: usize, b_start: usize, b_len: usize) -> bool {
    a_start < b_start + b_len && b_start < a_start + a_len
}

impl Command {
    pub(crate) fn read_buffer(
        device: ObjectId,
        src: &Buffer,
        host: &HostMemory,
        regions: &[BufferRegion],
    ) -> HalResult<Self> {
        check_owner(device, src.device_id(), "source buffer")?;
        check_regions(regions)?;
        let src = src.binding()?.clone();
        for region in regions {
            src.range(region.src_offset, region.size)?;
            host_range_ok(host, region.dst_offset, region.size)?;
        }
        Ok(Self::ReadBuffer {
            src,
            host: host.clone(),
            regions: regions.to_vec(),
        })
    }

    pub(crate) fn write_buffer(
        device: ObjectId,
        dst: &Buffer,
        host: &HostMemory,
        regions: &[BufferRegion],
    ) -> HalResult<Self> {
        check_owner(device, dst.device_id(), "destination buffer")?;
        check_regions(regions)?;
        let dst = dst.binding()?.clone();
        for region in regions {
            host_range_ok(host, region.src_offset, region.size)?;
            dst.range(region.dst_offset, region.size)?;
        }
        Ok(Self::WriteBuffer {
            dst,
            host: host.clone(),
            regions: regions.to_vec(),
        })
    }

    pub(crate) fn copy_buffer(
        device: ObjectId,
        src: &Buffer,
        dst: &Buffer,
        regions: &[BufferRegion],
    ) -> HalResult<Self> {
        check_owner(device, src.device_id(), "source buffer")?;
        check_owner(device, dst.device_id(), "destination buffer")?;
        check_regions(regions)?;
        let src = src.binding()?.clone();
        let dst = dst.binding()?.clone();
        for region in regions {
            let from = src.range(region.src_offset, region.size)?;
            let to = dst.range(region.dst_offset, region.size)?;
            if src.aliases(&dst) && overlaps(from.start, from.len(), to.start, to.len()) {
                return Err(HalError::invalid(format!(
                    "copy region {region:?} overlaps itself"
                )));
            }
        }
        Ok(Self::CopyBuffer {
            src,
            dst,
            regions: regions.to_vec(),
        })
    }

    pub(crate) fn fill_buffer(
        device: ObjectId,
        dst: &Buffer,
        offset: u64,
        size: u64,
        pattern: &[u8],
    ) -> HalResult<Self> {
        check_owner(device, dst.device_id(), "destination buffer")?;
        if pattern.is_empty() || pattern.len() > MAX_FILL_PATTERN_SIZE {
            return Err(HalError::invalid(format!(
                "fill pattern must be 1..={MAX_FILL_PATTERN_SIZE} bytes, got {}",
                pattern.len()
            )));
        }
        if size == 0 || size % pattern.len() as u64 != 0 {
            return Err(HalError::invalid(format!(
                "fill size {size} is not a non-zero multiple of the {}-byte pattern",
                pattern.len()
            )));
        }
        let dst = dst.binding()?.clone();
        dst.range(offset, size)?;
        Ok(Self::FillBuffer {
            dst,
            offset,
            size,
            pattern: pattern.to_vec(),
        })
    }

    pub(crate) fn read_image(
        device: ObjectId,
        src: &Image,
        region: ImageRegion,
        host: &HostMemory,
        layout: HostLayout,
    ) -> HalResult<Self> {
        check_owner(device, src.device_id(), "source image")?;
        let src = src.binding()?.clone();
        src.check_region(&region)?;
        let layout = layout.resolve(&region, src.desc().format.texel_size(), host.len())?;
        Ok(Self::ReadImage {
            src,
            region,
            host: host.clone(),
            layout,
        })
    }

    pub(crate) fn write_image(
        device: ObjectId,
        dst: &Image,
        region: ImageRegion,
        host: &HostMemory,
        layout: HostLayout,
    ) -> HalResult<Self> {
        check_owner(device, dst.device_id(), "destination image")?;
        let dst = dst.binding()?.clone();
        dst.check_region(&region)?;
        let layout = layout.resolve(&region, dst.desc().format.texel_size(), host.len())?;
        Ok(Self::WriteImage {
            dst,
            region,
            host: host.clone(),
            layout,
        })
    }

    pub(crate) fn fill_image(device: ObjectId, dst: &Image, region: ImageRegion, texel: &[u8]) -> HalResult<Self> {
        check_owner(device, dst.device_id(), "destination image")?;
        let dst = dst.binding()?.clone();
        dst.check_region(&region)?;
        if texel.len() as u64 != dst.desc().format.texel_size() {
            return Err(HalError::invalid(format!(
                "fill texel is {} bytes, {:?} texels are {}",
                texel.len(),
                dst.desc().format,
                dst.desc().format.texel_size()
            )));
        }
        Ok(Self::FillImage {
            dst,
            region,
            texel: texel.to_vec(),
        })
    }

    pub(crate) fn copy_image(
        device: ObjectId,
        src: &Image,
        src_origin: [u64; 3],
        dst: &Image,
        dst_region: ImageRegion,
    ) -> HalResult<Self> {
        check_owner(device, src.device_id(), "source image")?;
        check_owner(device, dst.device_id(), "destination image")?;
        let src = src.binding()?.clone();
        let dst = dst.binding()?.clone();
        if src.desc().format.texel_size() != dst.desc().format.texel_size() {
            return Err(HalError::invalid("image copy between formats of different texel size"));
        }
        src.check_region(&ImageRegion::new(src_origin, dst_region.extent))?;
        dst.check_region(&dst_region)?;
        if src.image == dst.image {
            return Err(HalError::invalid("image copy source and destination must differ"));
        }
        Ok(Self::CopyImage {
            src,
            src_origin,
            dst,
            dst_region,
        })
    }

    pub(crate) fn copy_image_to_buffer(
        device: ObjectId,
        src: &Image,
        region: ImageRegion,
        dst: &Buffer,
        dst_offset: u64,
    ) -> HalResult<Self> {
        check_owner(device, src.device_id(), "source image")?;
        check_owner(device, dst.device_id(), "destination buffer")?;
        let src = src.binding()?.clone();
        let dst = dst.binding()?.clone();
        src.check_region(&region)?;
        dst.range(dst_offset, region.texel_count() * src.desc().format.texel_size())?;
        Ok(Self::CopyImageToBuffer {
            src,
            region,
            dst,
            dst_offset,
        })
    }

    pub(crate) fn copy_buffer_to_image(
        device: ObjectId,
        src: &Buffer,
        src_offset: u64,
        dst: &Image,
        region: ImageRegion,
    ) -> HalResult<Self> {
        check_owner(device, src.device_id(), "source buffer")?;
        check_owner(device, dst.device_id(), "destination image")?;
        let src = src.binding()?.clone();
        let dst = dst.binding()?.clone();
        dst.check_region(&region)?;
        src.range(src_offset, region.texel_count() * dst.desc().format.texel_size())?;
        Ok(Self::CopyBufferToImage {
            src,
            src_offset,
            dst,
            region,
        })
    }

    pub(crate) fn nd_range(device: ObjectId, kernel: &Kernel, options: NdRangeOptions) -> HalResult<Self> {
        check_owner(device, kernel.device_id(), "kernel")?;
        options.validate(kernel.shared(), device)?;
        Ok(Self::NdRange(NdRangeCommand {
            kernel: Arc::clone(kernel.shared()),
            options,
        }))
    }

    pub(crate) fn query(
        device: ObjectId,
        kind: CommandKind,
        pool: &QueryPool,
        index: u32,
        count: u32,
    ) -> HalResult<Self> {
        check_owner(device, pool.device_id(), "query pool")?;
        pool.shared().check_range(index, count)?;
        let pool = Arc::clone(pool.shared());
        match kind {
            CommandKind::BeginQuery => Ok(Self::BeginQuery { pool, index, count }),
            CommandKind::EndQuery => Ok(Self::EndQuery { pool, index, count }),
            CommandKind::ResetQueryPool => Ok(Self::ResetQueryPool { pool, index, count }),
            other => Err(HalError::Internal(format!("{other:?} is not a query command"))),
        }
    }

    pub(crate) const fn kind(&self) -> CommandKind {
        match self {
            Self::ReadBuffer { .. } => CommandKind::ReadBuffer,
            Self::WriteBuffer { .. } => CommandKind::WriteBuffer,
            Self::CopyBuffer { .. } => CommandKind::CopyBuffer,
            Self::FillBuffer { .. } => CommandKind::FillBuffer,
            Self::ReadImage { .. } => CommandKind::ReadImage,
            Self::WriteImage { .. } => CommandKind::WriteImage,
            Self::FillImage { .. } => CommandKind::FillImage,
            Self::CopyImage { .. } => CommandKind::CopyImage,
            Self::CopyImageToBuffer { .. } => CommandKind::CopyImageToBuffer,
            Self::CopyBufferToImage { .. } => CommandKind::CopyBufferToImage,
            Self::NdRange(_) => CommandKind::NdRange,
            Self::UserCallback(_) => CommandKind::UserCallback,
            Self::BeginQuery { .. } => CommandKind::BeginQuery,
            Self::EndQuery { .. } => CommandKind::EndQuery,
            Self::ResetQueryPool { .. } => CommandKind::ResetQueryPool,
        }
    }

    /// Query commands are bookkeeping and stay out of the queue counters.
    pub(crate) const fn is_query(&self) -> bool {
        matches!(
            self,
            Self::BeginQuery { .. } | Self::EndQuery { .. } | Self::ResetQueryPool { .. }
        )
    }

    pub(crate) fn nd_range_mut(&mut self) -> Option<&mut NdRangeCommand> {
        match self {
            Self::NdRange(command) => Some(command),
            _ => None,
        }
    }

    pub(crate) fn execute(&self, command_id: u32, ctx: &ExecContext<'_>) -> HalResult<()> {
        match self {
            Self::ReadBuffer { src, host, regions } => {
                for region in regions {
                    let bytes = src.read(region.src_offset, region.size)?;
                    host.write(region.dst_offset as usize, &bytes)?;
                    ctx.counters.record_transfer(region.size);
                }
            }
            Self::WriteBuffer { dst, host, regions } => {
                for region in regions {
                    let bytes = host.read(region.src_offset as usize, region.size as usize)?;
                    dst.write(region.dst_offset, &bytes)?;
                    ctx.counters.record_transfer(region.size);
                }
            }
            Self::CopyBuffer { src, dst, regions } => {
                for region in regions {
                    let bytes = src.read(region.src_offset, region.size)?;
                    dst.write(region.dst_offset, &bytes)?;
                    ctx.counters.record_transfer(region.size);
                }
            }
            Self::FillBuffer {
                dst,
                offset,
                size,
                pattern,
            } => {
                dst.fill(*offset, *size, pattern)?;
                ctx.counters.record_transfer(*size);
            }
            Self::ReadImage {
                src,
                region,
                host,
                layout,
            } => {
                let packed = src.read_region(region)?;
                let row_len = packed.len() / (region.extent[1] * region.extent[2]) as usize;
                let ranges = layout.row_ranges(region, row_len)?;
                host.with_bytes_mut(|bytes| -> HalResult<()> {
                    for (row, range) in packed.chunks_exact(row_len).zip(ranges) {
                        bytes
                            .get_mut(range)
                            .ok_or_else(|| HalError::invalid("host row outside host memory"))?
                            .copy_from_slice(row);
                    }
                    Ok(())
                })?;
                ctx.counters.record_transfer(packed.len() as u64);
            }
            Self::WriteImage {
                dst,
                region,
                host,
                layout,
            } => {
                let row_len = (region.extent[0] * dst.desc().format.texel_size()) as usize;
                let ranges = layout.row_ranges(region, row_len)?;
                let packed = host.with_bytes_mut(|bytes| -> HalResult<Vec<u8>> {
                    let mut packed = Vec::with_capacity(row_len * ranges.len());
                    for range in ranges {
                        let row = bytes
                            .get(range)
                            .ok_or_else(|| HalError::invalid("host row outside host memory"))?;
                        packed.extend_from_slice(row);
                    }
                    Ok(packed)
                })?;
                dst.write_region(region, &packed)?;
                ctx.counters.record_transfer(packed.len() as u64);
            }
            Self::FillImage { dst, region, texel } => {
                dst.fill_region(region, texel)?;
                ctx.counters
                    .record_transfer(region.texel_count() * texel.len() as u64);
            }
            Self::CopyImage {
                src,
                src_origin,
                dst,
                dst_region,
            } => {
                let packed = src.read_region(&ImageRegion::new(*src_origin, dst_region.extent))?;
                dst.write_region(dst_region, &packed)?;
                ctx.counters.record_transfer(packed.len() as u64);
            }
            Self::CopyImageToBuffer {
                src,
                region,
                dst,
                dst_offset,
            } => {
                let packed = src.read_region(region)?;
                dst.write(*dst_offset, &packed)?;
                ctx.counters.record_transfer(packed.len() as u64);
            }
            Self::CopyBufferToImage {
                src,
                src_offset,
                dst,
                region,
            } => {
                let len = region.texel_count() * dst.desc().format.texel_size();
                let packed = src.read(*src_offset, len)?;
                dst.write_region(region, &packed)?;
                ctx.counters.record_transfer(len);
            }
            Self::NdRange(command) => command.execute(ctx)?,
            Self::UserCallback(callback) => callback(&CallbackContext {
                queue: ctx.queue,
                command_buffer: ctx.command_buffer,
                command_id,
            }),
            Self::BeginQuery { pool, index, count } => pool.begin(*index, *count, ctx.counters),
            Self::EndQuery { pool, index, count } => pool.end(*index, *count, ctx.counters)?,
            Self::ResetQueryPool { pool, index, count } => pool.reset(*index, *count),
        }
        Ok(())
    }
}

impl NdRangeCommand {
    /// Replaces argument `index`, checking the replacement's kind.
    pub(crate) fn replace_descriptor(&mut self, index: usize, descriptor: DescriptorInfo, device: ObjectId) -> HalResult<()> {
        let current = self.options.descriptors.get(index).ok_or_else(|| {
            HalError::invalid(format!(
                "argument index {index} out of range for {} arguments",
                self.options.descriptors.len()
            ))
        })?;
        current.check_replacement(&descriptor)?;
        if let Some(owner) = descriptor.device() {
            check_owner(device, owner, "descriptor")?;
        }
        self.options.descriptors[index] = descriptor;
        Ok(())
    }

    /// Runs every work group in order. Local memory is fresh per group.
    fn execute(&self, ctx: &ExecContext<'_>) -> HalResult<()> {
        let options = &self.options;
        let groups = [
            options.global_size[0] / options.local_size[0],
            options.global_size[1] / options.local_size[1],
            options.global_size[2] / options.local_size[2],
        ];
        for gz in 0..groups[2] {
            for gy in 0..groups[1] {
                for gx in 0..groups[0] {
                    let args = KernelArgs::new(
                        options.descriptors.iter().map(DescriptorInfo::resolve).collect(),
                    );
                    self.run_group([gx, gy, gz], &args)?;
                }
            }
        }
        ctx.counters.record_launch(options.work_items());
        Ok(())
    }

    fn run_group(&self, group_id: [usize; 3], args: &KernelArgs) -> HalResult<()> {
        let options = &self.options;
        let local = options.local_size;
        for lz in 0..local[2] {
            for ly in 0..local[1] {
                for lx in 0..local[0] {
                    let local_id = [lx, ly, lz];
                    let global_id = [
                        options.global_offset[0] + group_id[0] * local[0] + lx,
                        options.global_offset[1] + group_id[1] * local[1] + ly,
                        options.global_offset[2] + group_id[2] * local[2] + lz,
                    ];
                    let item = WorkItem {
                        global_id,
                        local_id,
                        group_id,
                        global_size: options.global_size,
                        local_size: local,
                        global_offset: options.global_offset,
                        dimensions: options.dimensions,
                    };
                    self.kernel.body.execute(&item, args).map_err(|e| {
                        HalError::Failure(format!("kernel {} failed: {e}", self.kernel.name))
                    })?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_defaults_to_packed() {
        let region = ImageRegion::new([0, 0, 0], [4, 2, 1]);
        let layout = HostLayout::packed(8).resolve(&region, 4, 40).unwrap();
        assert_eq!((layout.row_pitch, layout.slice_pitch), (16, 32));
        assert_eq!(layout.row_ranges(&region, 16).unwrap(), vec![8..24, 24..40]);
        assert!(HostLayout::packed(9).resolve(&region, 4, 40).is_err());
    }

    #[test]
    fn test_layout_rejects_short_pitch() {
        let region = ImageRegion::new([0, 0, 0], [4, 2, 1]);
        let layout = HostLayout {
            offset: 0,
            row_pitch: 8,
            slice_pitch: 0,
        };
        assert!(layout.resolve(&region, 4, 1024).is_err());
    }

    #[test]
    fn test_layout_overflow_is_invalid_value() {
        let region = ImageRegion::new([0, 0, 0], [4, 2, 1]);
        let near_end = HostLayout::packed(u64::MAX - 4);
        assert!(matches!(
            near_end.resolve(&region, 4, 1024),
            Err(HalError::InvalidValue(_))
        ));

        let huge_pitch = HostLayout {
            offset: 0,
            row_pitch: u64::MAX / 2,
            slice_pitch: 0,
        };
        assert!(matches!(
            huge_pitch.resolve(&region, 4, 1024),
            Err(HalError::InvalidValue(_))
        ));

        let wide = ImageRegion::new([0, 0, 0], [u64::MAX, 1, 1]);
        assert!(matches!(
            HostLayout::packed(0).resolve(&wide, 4, 1024),
            Err(HalError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_options_pad_dimensions() {
        let options = NdRangeOptions::new(&[8, 4]).local_size(&[2, 2]).global_offset(&[1]);
        assert_eq!(options.dimensions, 2);
        assert_eq!(options.global_size, [8, 4, 1]);
        assert_eq!(options.local_size, [2, 2, 1]);
        assert_eq!(options.global_offset, [1, 0, 0]);
        assert_eq!(options.work_items(), 32);
    }

    #[test]
    fn test_overlap() {
        assert!(overlaps(0, 8, 4, 8));
        assert!(!overlaps(0, 4, 4, 4));
    }
}
