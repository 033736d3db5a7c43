//! # ANVIL Core
//!
//! The vocabulary shared by every part of the HAL:
//! - Result codes and the [`HalError`] type
//! - Packed object identifiers
//! - The per-device allocator boundary
//! - Device capability records and platform enumeration
//! - Host memory regions shared with device queues
//!
//! ## Example
//!
//! ```rust,ignore
//! use anvil_core::{DeviceTypeFilter, Platform};
//!
//! let platform = Platform::from_toml_file("devices.toml")?;
//! for info in platform.device_infos(DeviceTypeFilter::ALL) {
//!     println!("{} ({:?})", info.name, info.device_type);
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod allocator;
pub mod error;
pub mod host;
pub mod id;
pub mod info;

pub use allocator::{
    AllocFn, CallbackAllocator, FreeFn, HostAllocation, HostAllocator, HostCharge, SystemAllocator,
};
pub use error::{HalError, HalResult, ResultCode};
pub use host::HostMemory;
pub use id::{IdAllocator, ObjectId, ObjectType};
pub use info::{
    Capabilities, CounterDescription, CounterKind, CounterStorage, DeviceInfo, DeviceType,
    DeviceTypeFilter, ExecutorConfig, Platform, QueueType,
};
