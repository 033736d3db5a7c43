//! # ANVIL Runtime
//!
//! Command-buffer execution and synchronization engine:
//! - Devices with per-device memory heaps and allocators
//! - Command buffers recorded against a sync-point dependency graph
//! - Queues that run dispatches on a dedicated worker thread
//! - Fences, semaphores and query pools for cross-dispatch ordering
//!
//! ## Architecture Rules
//!
//! 1. **`dispatch` never blocks** - execution happens on the queue worker
//! 2. **Same-queue FIFO** - dispatches on one queue start in submission order
//! 3. **Failures travel through fences** - a failed dispatch is never a
//!    synchronous error
//!
//! ## Example
//!
//! ```rust,ignore
//! use anvil_core::QueueType;
//! use anvil_runtime::Device;
//!
//! let device = Device::host()?;
//! let queue = device.queue(QueueType::Compute, 0)?;
//! let mut command_buffer = device.create_command_buffer(None)?;
//! let fill = command_buffer.fill_buffer(&buffer, 0, 64, &[0xAB], &[])?;
//! command_buffer.copy_buffer(&buffer, 0, &other, 0, 64, &[fill])?;
//! command_buffer.finalize()?;
//!
//! let fence = device.create_fence()?;
//! queue.dispatch(&mut command_buffer, Some(&fence), &[], &[], None)?;
//! queue.try_wait(&fence, u64::MAX)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

mod builtins;
pub mod command;
pub mod command_buffer;
pub mod descriptor;
pub mod device;
mod executor;
pub mod fence;
pub mod kernel;
pub mod memory;
pub mod query;
pub mod queue;
pub mod semaphore;
pub mod sync_point;

pub use command::{
    BufferRegion, CallbackContext, CommandKind, HostLayout, NdRangeOptions, UserCallback,
    MAX_FILL_PATTERN_SIZE,
};
pub use command_buffer::{CommandBuffer, CommandBufferState, MessageCallback};
pub use descriptor::{BufferDescriptor, DescriptorInfo, DescriptorKind, ImageDescriptor};
pub use device::{create_devices, Device};
pub use fence::{Fence, FenceStatus};
pub use kernel::{
    BufferView, Executable, ExecutableBinary, ImageView, Kernel, KernelArg, KernelArgs,
    KernelBody, KernelLibrary, KernelProperties, LocalView, WorkItem,
};
pub use memory::{
    AddressingMode, Buffer, FilterMode, Image, ImageDesc, ImageFormat, ImageRegion, ImageType,
    Memory, MemoryProperties, SamplerDesc,
};
pub use query::{
    required_passes, CounterRecord, CounterValue, DurationRecord, QueryPool, QueryResult,
    QueryType, QUERY_RESULT_SIZE,
};
pub use queue::{CompletionCallback, Queue, QueueStats};
pub use semaphore::Semaphore;
pub use sync_point::SyncPoint;
