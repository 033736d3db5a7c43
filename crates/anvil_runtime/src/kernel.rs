//! # Kernels and Executables
//!
//! Kernel code itself comes from outside the engine. A [`KernelLibrary`]
//! maps entry-point names to [`KernelBody`] implementations; an
//! [`Executable`] is a loaded binary naming some of those entry points, and a
//! [`Kernel`] is one entry point ready to be referenced by ND-range commands.
//!
//! ## Binary Container
//!
//! ```text
//! [magic "ANVL":4][version u32 LE][entry count u32 LE]
//! repeat count: [name length u32 LE][name bytes (UTF-8)]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anvil_core::{DeviceInfo, HalError, HalResult, HostCharge, ObjectId};
use bytemuck::Pod;
use parking_lot::Mutex;

use crate::memory::{BufferBinding, ImageBinding, ImageRegion, SamplerDesc};

/// Coordinates of one work item inside an ND-range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkItem {
    /// Global id, including the global offset.
    pub global_id: [usize; 3],
    /// Id within the work group.
    pub local_id: [usize; 3],
    /// Work group id.
    pub group_id: [usize; 3],
    /// Global size per dimension.
    pub global_size: [usize; 3],
    /// Work-group size per dimension.
    pub local_size: [usize; 3],
    /// Offset added to every global id.
    pub global_offset: [usize; 3],
    /// Number of dimensions in use (1 to 3).
    pub dimensions: usize,
}

impl WorkItem {
    /// Row-major linear global index, ignoring the global offset.
    #[must_use]
    pub fn linear_global_id(&self) -> usize {
        let [x, y, z] = [
            self.global_id[0] - self.global_offset[0],
            self.global_id[1] - self.global_offset[1],
            self.global_id[2] - self.global_offset[2],
        ];
        (z * self.global_size[1] + y) * self.global_size[0] + x
    }

    /// Row-major linear id within the work group.
    #[must_use]
    pub fn linear_local_id(&self) -> usize {
        let [x, y, z] = self.local_id;
        (z * self.local_size[1] + y) * self.local_size[0] + x
    }

    /// Row-major linear work-group id.
    #[must_use]
    pub fn linear_group_id(&self) -> usize {
        let groups = [
            self.global_size[0] / self.local_size[0],
            self.global_size[1] / self.local_size[1],
        ];
        let [x, y, z] = self.group_id;
        (z * groups[1] + y) * groups[0] + x
    }
}

/// Byte offset and size of the `index`-th `T`; the end never overflows.
fn element_span<T: Pod>(index: usize) -> HalResult<(usize, usize)> {
    let size = std::mem::size_of::<T>();
    index
        .checked_mul(size)
        .filter(|start| start.checked_add(size).is_some())
        .map(|start| (start, size))
        .ok_or_else(|| HalError::Failure(format!("element index {index} overflows")))
}

/// A bound buffer argument.
#[derive(Clone, Debug)]
pub struct BufferView {
    binding: BufferBinding,
}

impl BufferView {
    pub(crate) fn new(binding: BufferBinding) -> Self {
        Self { binding }
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.binding.size()
    }

    /// True for a zero-sized view.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the `index`-th `T`.
    pub fn read<T: Pod>(&self, index: usize) -> HalResult<T> {
        let (start, size) = element_span::<T>(index)?;
        let bytes = self.binding.read(start as u64, size as u64)?;
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    /// Writes the `index`-th `T`.
    pub fn write<T: Pod>(&self, index: usize, value: T) -> HalResult<()> {
        let (start, _) = element_span::<T>(index)?;
        self.binding.write(start as u64, bytemuck::bytes_of(&value))
    }

    /// Copies raw bytes out.
    pub fn read_bytes(&self, offset: u64, len: u64) -> HalResult<Vec<u8>> {
        self.binding.read(offset, len)
    }

    /// Copies raw bytes in.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> HalResult<()> {
        self.binding.write(offset, data)
    }
}

/// A bound image argument.
#[derive(Clone, Debug)]
pub struct ImageView {
    binding: ImageBinding,
}

impl ImageView {
    pub(crate) fn new(binding: ImageBinding) -> Self {
        Self { binding }
    }

    /// Addressable extent in texels.
    #[must_use]
    pub fn extent(&self) -> [u64; 3] {
        self.binding.desc().texel_extent()
    }

    /// Reads the texel at `coord`.
    pub fn read_texel(&self, coord: [u64; 3]) -> HalResult<Vec<u8>> {
        self.binding.read_region(&ImageRegion::new(coord, [1, 1, 1]))
    }

    /// Writes the texel at `coord`.
    pub fn write_texel(&self, coord: [u64; 3], texel: &[u8]) -> HalResult<()> {
        if texel.len() as u64 != self.binding.desc().format.texel_size() {
            return Err(HalError::invalid("texel size does not match image format"));
        }
        self.binding.write_region(&ImageRegion::new(coord, [1, 1, 1]), texel)
    }
}

/// Work-group local scratch memory.
#[derive(Clone, Debug)]
pub struct LocalView {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl LocalView {
    pub(crate) fn zeroed(size: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0; size])),
        }
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    /// True for a zero-sized block.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the `index`-th `T`.
    pub fn read<T: Pod>(&self, index: usize) -> HalResult<T> {
        let (start, size) = element_span::<T>(index)?;
        let bytes = self.bytes.lock();
        bytes
            .get(start..start + size)
            .map(bytemuck::pod_read_unaligned)
            .ok_or_else(|| HalError::Failure(format!("local read at {start} out of bounds")))
    }

    /// Writes the `index`-th `T`.
    pub fn write<T: Pod>(&self, index: usize, value: T) -> HalResult<()> {
        let (start, size) = element_span::<T>(index)?;
        let mut bytes = self.bytes.lock();
        let slot = bytes
            .get_mut(start..start + size)
            .ok_or_else(|| HalError::Failure(format!("local write at {start} out of bounds")))?;
        slot.copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }
}

/// One resolved kernel argument.
#[derive(Clone, Debug)]
pub enum KernelArg {
    /// A buffer.
    Buffer(BufferView),
    /// An image.
    Image(ImageView),
    /// Sampler state.
    Sampler(SamplerDesc),
    /// Inline bytes.
    PlainOldData(Vec<u8>),
    /// Per-work-group scratch memory.
    Local(LocalView),
    /// An explicitly null buffer.
    Null,
    /// Backend-defined bytes.
    Custom(Vec<u8>),
}

/// Arguments seen by one work group.
#[derive(Clone, Debug, Default)]
pub struct KernelArgs {
    args: Vec<KernelArg>,
}

impl KernelArgs {
    pub(crate) fn new(args: Vec<KernelArg>) -> Self {
        Self { args }
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// True if there are no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Argument at `index`.
    pub fn get(&self, index: usize) -> HalResult<&KernelArg> {
        self.args
            .get(index)
            .ok_or_else(|| HalError::Failure(format!("kernel argument {index} missing")))
    }

    /// Buffer argument at `index`.
    pub fn buffer(&self, index: usize) -> HalResult<&BufferView> {
        match self.get(index)? {
            KernelArg::Buffer(view) => Ok(view),
            other => Err(mismatch(index, "buffer", other)),
        }
    }

    /// Image argument at `index`.
    pub fn image(&self, index: usize) -> HalResult<&ImageView> {
        match self.get(index)? {
            KernelArg::Image(view) => Ok(view),
            other => Err(mismatch(index, "image", other)),
        }
    }

    /// Sampler argument at `index`.
    pub fn sampler(&self, index: usize) -> HalResult<SamplerDesc> {
        match self.get(index)? {
            KernelArg::Sampler(desc) => Ok(*desc),
            other => Err(mismatch(index, "sampler", other)),
        }
    }

    /// Local memory argument at `index`.
    pub fn local(&self, index: usize) -> HalResult<&LocalView> {
        match self.get(index)? {
            KernelArg::Local(view) => Ok(view),
            other => Err(mismatch(index, "local buffer", other)),
        }
    }

    /// Inline value at `index`, which must be exactly `size_of::<T>()` bytes.
    pub fn plain<T: Pod>(&self, index: usize) -> HalResult<T> {
        match self.get(index)? {
            KernelArg::PlainOldData(bytes) if bytes.len() == std::mem::size_of::<T>() => {
                Ok(bytemuck::pod_read_unaligned(bytes))
            }
            other => Err(mismatch(index, std::any::type_name::<T>(), other)),
        }
    }

    /// Custom bytes at `index`.
    pub fn custom(&self, index: usize) -> HalResult<&[u8]> {
        match self.get(index)? {
            KernelArg::Custom(bytes) => Ok(bytes),
            other => Err(mismatch(index, "custom data", other)),
        }
    }
}

fn mismatch(index: usize, expected: &str, found: &KernelArg) -> HalError {
    HalError::Failure(format!(
        "kernel argument {index}: expected {expected}, found {found:?}"
    ))
}

/// Executable kernel code.
///
/// `execute` runs once per work item. Items of one work group run on the
/// same thread in linear local-id order, so local memory written by item
/// `n` is visible to every later item of the group.
pub trait KernelBody: Send + Sync + fmt::Debug {
    /// Runs one work item. An error fails the whole dispatch.
    fn execute(&self, item: &WorkItem, args: &KernelArgs) -> HalResult<()>;
}

/// Static properties of a kernel entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelProperties {
    /// Local size the kernel must be dispatched with, if fixed at compile time.
    pub required_local_size: Option<[usize; 3]>,
    /// Local size the kernel runs best with.
    pub preferred_local_size: [usize; 3],
}

impl Default for KernelProperties {
    fn default() -> Self {
        Self {
            required_local_size: None,
            preferred_local_size: [64, 1, 1],
        }
    }
}

#[derive(Clone, Debug)]
struct LibraryEntry {
    body: Arc<dyn KernelBody>,
    properties: KernelProperties,
    builtin: bool,
}

/// The kernel entry points a device can load.
#[derive(Clone, Debug, Default)]
pub struct KernelLibrary {
    entries: HashMap<String, LibraryEntry>,
}

impl KernelLibrary {
    /// Creates an empty library.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A library holding the standard built-in kernels.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut library = Self::new();
        crate::builtins::register(&mut library);
        library
    }

    /// Registers a kernel that executables may reference.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        body: Arc<dyn KernelBody>,
        properties: KernelProperties,
    ) {
        self.insert(name.into(), body, properties, false);
    }

    /// Registers a kernel that is only reachable through
    /// `Device::create_built_in_kernel`.
    pub fn register_builtin(
        &mut self,
        name: impl Into<String>,
        body: Arc<dyn KernelBody>,
        properties: KernelProperties,
    ) {
        self.insert(name.into(), body, properties, true);
    }

    /// Builder form of [`KernelLibrary::register`].
    #[must_use]
    pub fn with_kernel(
        mut self,
        name: impl Into<String>,
        body: Arc<dyn KernelBody>,
        properties: KernelProperties,
    ) -> Self {
        self.register(name, body, properties);
        self
    }

    fn insert(&mut self, name: String, body: Arc<dyn KernelBody>, properties: KernelProperties, builtin: bool) {
        self.entries.insert(
            name,
            LibraryEntry {
                body,
                properties,
                builtin,
            },
        );
    }

    /// True if `name` is registered for executables.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|entry| !entry.builtin)
    }

    /// Names of the built-in kernels, sorted.
    #[must_use]
    pub fn builtin_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.builtin)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    fn lookup(&self, name: &str, builtin: bool) -> HalResult<&LibraryEntry> {
        self.entries
            .get(name)
            .filter(|entry| entry.builtin == builtin)
            .ok_or_else(|| HalError::MissingKernel(name.to_string()))
    }
}

/// Encoding and decoding of the executable container.
pub struct ExecutableBinary;

impl ExecutableBinary {
    /// Container magic.
    pub const MAGIC: [u8; 4] = *b"ANVL";
    /// Container version understood by this engine.
    pub const VERSION: u32 = 1;

    /// Builds a container naming `entries`.
    #[must_use]
    pub fn encode(entries: &[&str]) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + entries.iter().map(|e| 4 + e.len()).sum::<usize>());
        out.extend_from_slice(&Self::MAGIC);
        out.extend_from_slice(&Self::VERSION.to_le_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for entry in entries {
            out.extend_from_slice(&(entry.len() as u32).to_le_bytes());
            out.extend_from_slice(entry.as_bytes());
        }
        out
    }

    /// Parses a container into its entry names.
    pub fn decode(binary: &[u8]) -> HalResult<Vec<String>> {
        let mut reader = Reader { bytes: binary };
        if reader.take(4)? != Self::MAGIC {
            return Err(HalError::InvalidBinary("bad magic".to_string()));
        }
        let version = reader.u32()?;
        if version != Self::VERSION {
            return Err(HalError::InvalidBinary(format!("unsupported version {version}")));
        }
        let count = reader.u32()?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let len = reader.u32()? as usize;
            let name = std::str::from_utf8(reader.take(len)?)
                .map_err(|e| HalError::InvalidBinary(format!("entry name is not UTF-8: {e}")))?;
            entries.push(name.to_string());
        }
        if !reader.bytes.is_empty() {
            return Err(HalError::InvalidBinary(format!(
                "{} trailing bytes",
                reader.bytes.len()
            )));
        }
        Ok(entries)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> HalResult<&'a [u8]> {
        if self.bytes.len() < len {
            return Err(HalError::InvalidBinary("truncated binary".to_string()));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn u32(&mut self) -> HalResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// A loaded executable.
#[derive(Debug)]
pub struct Executable {
    id: ObjectId,
    device: ObjectId,
    entries: Vec<String>,
    _charge: HostCharge,
}

impl Executable {
    pub(crate) fn load(
        id: ObjectId,
        device: ObjectId,
        binary: &[u8],
        library: &KernelLibrary,
        charge: HostCharge,
    ) -> HalResult<Self> {
        let entries = ExecutableBinary::decode(binary)?;
        if let Some(missing) = entries.iter().find(|name| !library.contains(name)) {
            return Err(HalError::MissingKernel(missing.clone()));
        }
        Ok(Self {
            id,
            device,
            entries,
            _charge: charge,
        })
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

    /// Entry point names.
    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

/// Limits a kernel is dispatched under.
#[derive(Clone, Copy, Debug)]
pub(crate) struct KernelLimits {
    pub(crate) max_work_group_size: [usize; 3],
    pub(crate) max_work_width: usize,
    pub(crate) sub_group_size: usize,
    pub(crate) max_sub_group_count: usize,
}

impl KernelLimits {
    pub(crate) fn from_info(info: &DeviceInfo) -> Self {
        Self {
            max_work_group_size: info.max_work_group_size.map(|size| size as usize),
            max_work_width: info.max_work_width as usize,
            sub_group_size: info.sub_group_size as usize,
            max_sub_group_count: info.max_sub_group_count as usize,
        }
    }

    /// Checks a local size against the device limits.
    pub(crate) fn check_local_size(&self, local_size: [usize; 3]) -> HalResult<()> {
        if local_size.contains(&0) {
            return Err(HalError::invalid("local size must be non-zero in every dimension"));
        }
        let within = local_size
            .iter()
            .zip(self.max_work_group_size)
            .all(|(&size, max)| size <= max);
        if !within || local_size.iter().product::<usize>() > self.max_work_width {
            return Err(HalError::invalid(format!(
                "local size {local_size:?} exceeds device limits {:?} / {}",
                self.max_work_group_size, self.max_work_width
            )));
        }
        Ok(())
    }
}

/// Shared state of a kernel, referenced by recorded ND-range commands.
#[derive(Debug)]
pub(crate) struct KernelShared {
    pub(crate) id: ObjectId,
    pub(crate) device: ObjectId,
    pub(crate) name: String,
    pub(crate) body: Arc<dyn KernelBody>,
    pub(crate) properties: KernelProperties,
    pub(crate) limits: KernelLimits,
}

/// One kernel entry point.
#[derive(Debug)]
pub struct Kernel {
    shared: Arc<KernelShared>,
    _charge: HostCharge,
}

impl Kernel {
    pub(crate) fn from_library(
        id: ObjectId,
        device: ObjectId,
        name: &str,
        builtin: bool,
        library: &KernelLibrary,
        limits: KernelLimits,
        charge: HostCharge,
    ) -> HalResult<Self> {
        let entry = library.lookup(name, builtin)?;
        Ok(Self {
            shared: Arc::new(KernelShared {
                id,
                device,
                name: name.to_string(),
                body: Arc::clone(&entry.body),
                properties: entry.properties,
                limits,
            }),
            _charge: charge,
        })
    }

    pub(crate) fn shared(&self) -> &Arc<KernelShared> {
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
        self.shared.device
    }

    /// Entry point name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Largest number of sub-groups a work group of this kernel can hold.
    #[must_use]
    pub fn max_num_sub_groups(&self) -> usize {
        let limits = &self.shared.limits;
        limits
            .max_work_width
            .div_ceil(limits.sub_group_size)
            .min(limits.max_sub_group_count)
    }

    /// Sub-group size used for a dispatch with `local_size`.
    ///
    /// Work groups smaller than the device sub-group width run as one
    /// narrower sub-group.
    pub fn sub_group_size_for_local_size(&self, local_size: [usize; 3]) -> HalResult<usize> {
        self.shared.limits.check_local_size(local_size)?;
        let items = local_size.iter().product::<usize>();
        Ok(items.min(self.shared.limits.sub_group_size))
    }

    /// Local size that yields exactly `count` sub-groups.
    pub fn local_size_for_sub_group_count(&self, count: usize) -> HalResult<[usize; 3]> {
        if count == 0 || count > self.max_num_sub_groups() {
            return Err(HalError::invalid(format!(
                "{count} sub-groups requested, kernel supports 1..={}",
                self.max_num_sub_groups()
            )));
        }
        let local_size = [count * self.shared.limits.sub_group_size, 1, 1];
        self.shared.limits.check_local_size(local_size)?;
        Ok(local_size)
    }

    /// Preferred local sizes, one per dimension.
    #[must_use]
    pub fn preferred_local_sizes(&self) -> [usize; 3] {
        self.shared.properties.preferred_local_size
    }

    /// Local size fixed at compile time, if any.
    #[must_use]
    pub fn required_local_size(&self) -> Option<[usize; 3]> {
        self.shared.properties.required_local_size
    }
}
