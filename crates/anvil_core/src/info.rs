//! # Device Descriptions
//!
//! A [`DeviceInfo`] is the read-only capability record a backend publishes
//! for one device. The engine consults it for every capability-gated call
//! (descriptor updates, cloning, built-in kernels, counters, queue counts).
//!
//! Descriptions are plain data and load from TOML:
//!
//! ```toml
//! [[device]]
//! name = "anvil-cpu"
//! device_type = "cpu"
//! compute_queues = 2
//! memory_capacity = 268435456
//!
//! [device.capabilities]
//! descriptor_updates = true
//! command_buffer_clone = false
//! max_hardware_counters = 2
//! ```
//!
//! Any field left out takes the value of [`DeviceInfo::cpu`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HalError, HalResult};

/// Kind of device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Host processor.
    Cpu,
    /// Graphics processor.
    Gpu,
    /// Fixed-function or programmable accelerator.
    Accelerator,
    /// Anything else.
    Custom,
}

impl DeviceType {
    const fn bit(self) -> u32 {
        match self {
            Self::Cpu => 1,
            Self::Gpu => 1 << 1,
            Self::Accelerator => 1 << 2,
            Self::Custom => 1 << 3,
        }
    }
}

/// Set of device types used to filter enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceTypeFilter(u32);

impl DeviceTypeFilter {
    /// Matches every device.
    pub const ALL: Self = Self(0b1111);
    /// Matches nothing.
    pub const NONE: Self = Self(0);

    /// Filter matching a single type.
    #[must_use]
    pub const fn only(device_type: DeviceType) -> Self {
        Self(device_type.bit())
    }

    /// Adds a type to the filter.
    #[must_use]
    pub const fn with(self, device_type: DeviceType) -> Self {
        Self(self.0 | device_type.bit())
    }

    /// Returns true if `device_type` is in the set.
    #[must_use]
    pub const fn contains(self, device_type: DeviceType) -> bool {
        self.0 & device_type.bit() != 0
    }
}

/// Queue types. Fixed-size and contiguous from zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// General compute queue.
    Compute = 0,
}

impl QueueType {
    /// Number of queue types.
    pub const COUNT: usize = 1;
    /// Every queue type, indexed by discriminant.
    pub const ALL: [Self; Self::COUNT] = [Self::Compute];

    /// Index of this type in `0..COUNT`.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// How a counter value is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterStorage {
    /// Signed 32-bit.
    Int32,
    /// Signed 64-bit.
    Int64,
    /// Unsigned 32-bit.
    Uint32,
    /// Unsigned 64-bit.
    Uint64,
    /// 32-bit float.
    Float32,
    /// 64-bit float.
    Float64,
}

/// What a counter measures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    /// Commands executed.
    Commands,
    /// Bytes moved by transfer commands.
    BytesTransferred,
    /// Kernel work items executed.
    WorkItems,
    /// Kernel dispatches executed.
    KernelLaunches,
    /// Time spent executing commands, in milliseconds.
    BusyTime,
}

/// One counter the device can sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterDescription {
    /// Stable identifier used in counter configurations.
    pub uuid: u32,
    /// Human-readable name.
    pub name: String,
    /// What the counter measures.
    pub kind: CounterKind,
    /// Result storage type.
    pub storage: CounterStorage,
    /// Number of hardware counters sampling it consumes.
    pub hardware_counters: u32,
}

impl CounterDescription {
    /// Creates a description.
    #[must_use]
    pub fn new(
        uuid: u32,
        name: &str,
        kind: CounterKind,
        storage: CounterStorage,
        hardware_counters: u32,
    ) -> Self {
        Self {
            uuid,
            name: name.to_string(),
            kind,
            storage,
            hardware_counters,
        }
    }
}

/// Optional features a device may advertise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Kernel descriptors may be updated after finalize.
    pub descriptor_updates: bool,
    /// Finalized command buffers may be cloned.
    pub command_buffer_clone: bool,
    /// Backend-provided kernels may be created by name.
    pub builtin_kernels: bool,
    /// Image objects are supported.
    pub images: bool,
    /// Counters that can be sampled in a single pass.
    pub max_hardware_counters: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            descriptor_updates: true,
            command_buffer_clone: true,
            builtin_kernels: true,
            images: true,
            max_hardware_counters: 2,
        }
    }
}

/// Execution knobs for the host backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Run commands of the same dependency wave on separate threads.
    pub concurrent_commands: bool,
    /// Upper bound on threads used for one wave.
    pub max_command_threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrent_commands: true,
            max_command_threads: 4,
        }
    }
}

/// Capability record of one device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    /// Device name.
    pub name: String,
    /// Vendor string.
    pub vendor: String,
    /// Device kind.
    pub device_type: DeviceType,
    /// Number of compute queues.
    pub compute_queues: u32,
    /// Bytes of device memory available for allocation.
    pub memory_capacity: u64,
    /// Required alignment of buffer bindings, a power of two.
    pub buffer_alignment: u64,
    /// Largest work-group size per dimension.
    pub max_work_group_size: [u32; 3],
    /// Largest total work-group size.
    pub max_work_width: u32,
    /// Sub-group width.
    pub sub_group_size: u32,
    /// Largest number of sub-groups in one work-group.
    pub max_sub_group_count: u32,
    /// Optional features.
    pub capabilities: Capabilities,
    /// Counters available to counter query pools.
    pub query_counters: Vec<CounterDescription>,
    /// Host execution knobs.
    pub executor: ExecutorConfig,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self::cpu()
    }
}

impl DeviceInfo {
    /// The built-in host CPU device description.
    #[must_use]
    pub fn cpu() -> Self {
        Self {
            name: "anvil-cpu".to_string(),
            vendor: "ANVIL".to_string(),
            device_type: DeviceType::Cpu,
            compute_queues: 1,
            memory_capacity: 256 * 1024 * 1024,
            buffer_alignment: 16,
            max_work_group_size: [1024, 1024, 64],
            max_work_width: 1024,
            sub_group_size: 8,
            max_sub_group_count: 128,
            capabilities: Capabilities::default(),
            query_counters: vec![
                CounterDescription::new(1, "commands", CounterKind::Commands, CounterStorage::Uint64, 1),
                CounterDescription::new(
                    2,
                    "bytes_transferred",
                    CounterKind::BytesTransferred,
                    CounterStorage::Uint64,
                    1,
                ),
                CounterDescription::new(3, "work_items", CounterKind::WorkItems, CounterStorage::Int64, 1),
                CounterDescription::new(
                    4,
                    "kernel_launches",
                    CounterKind::KernelLaunches,
                    CounterStorage::Uint32,
                    1,
                ),
                CounterDescription::new(5, "busy_time_ms", CounterKind::BusyTime, CounterStorage::Float64, 2),
            ],
            executor: ExecutorConfig::default(),
        }
    }

    /// Number of queues of the given type.
    #[must_use]
    pub const fn queue_count(&self, queue_type: QueueType) -> u32 {
        match queue_type {
            QueueType::Compute => self.compute_queues,
        }
    }

    /// Looks up a counter by uuid.
    #[must_use]
    pub fn counter(&self, uuid: u32) -> Option<&CounterDescription> {
        self.query_counters.iter().find(|counter| counter.uuid == uuid)
    }

    /// Checks the description for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::MalformedDeviceEntry`] naming the first problem.
    pub fn validate(&self) -> HalResult<()> {
        let malformed = |what: &str| {
            Err(HalError::MalformedDeviceEntry(format!("{}: {what}", self.name)))
        };

        if self.name.is_empty() {
            return Err(HalError::MalformedDeviceEntry("device name is empty".to_string()));
        }
        if self.compute_queues == 0 {
            return malformed("a device needs at least one compute queue");
        }
        if !self.buffer_alignment.is_power_of_two() {
            return malformed("buffer_alignment must be a power of two");
        }
        if self.max_work_group_size.contains(&0) || self.max_work_width == 0 {
            return malformed("work-group limits must be non-zero");
        }
        if self.sub_group_size == 0 || self.max_sub_group_count == 0 {
            return malformed("sub-group limits must be non-zero");
        }
        for (index, counter) in self.query_counters.iter().enumerate() {
            if counter.hardware_counters == 0 {
                return malformed("a counter must consume at least one hardware counter");
            }
            if self.query_counters[..index]
                .iter()
                .any(|other| other.uuid == counter.uuid)
            {
                return malformed("counter uuids must be unique");
            }
        }
        Ok(())
    }

    /// Parses and validates a single `[device]`-shaped TOML document.
    pub fn from_toml_str(source: &str) -> HalResult<Self> {
        let info: Self = toml::from_str(source)
            .map_err(|e| HalError::MalformedDeviceEntry(e.to_string()))?;
        info.validate()?;
        Ok(info)
    }
}

#[derive(Deserialize)]
struct PlatformFile {
    #[serde(default, rename = "device")]
    devices: Vec<DeviceInfo>,
}

/// The set of device descriptions a process can enumerate.
#[derive(Clone, Debug, Default)]
pub struct Platform {
    devices: Vec<DeviceInfo>,
}

impl Platform {
    /// Creates a platform from explicit descriptions, validating each.
    pub fn new(devices: Vec<DeviceInfo>) -> HalResult<Self> {
        for device in &devices {
            device.validate()?;
        }
        Ok(Self { devices })
    }

    /// A platform with the single built-in CPU device.
    #[must_use]
    pub fn host() -> Self {
        Self {
            devices: vec![DeviceInfo::cpu()],
        }
    }

    /// Parses `[[device]]` tables from TOML.
    pub fn from_toml_str(source: &str) -> HalResult<Self> {
        let file: PlatformFile = toml::from_str(source)
            .map_err(|e| HalError::MalformedDeviceEntry(e.to_string()))?;
        Self::new(file.devices)
    }

    /// Reads and parses a platform file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> HalResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            HalError::MalformedDeviceEntry(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Descriptions whose type is in `filter`.
    #[must_use]
    pub fn device_infos(&self, filter: DeviceTypeFilter) -> Vec<&DeviceInfo> {
        self.devices
            .iter()
            .filter(|info| filter.contains(info.device_type))
            .collect()
    }

    /// Number of known devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}
