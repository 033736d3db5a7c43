//! # ANVIL
//!
//! Compute hardware abstraction layer, integrating the core vocabulary and
//! the execution engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            ANVIL                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐          ┌──────────────────────────┐  │
//! │  │   anvil_core     │─────────>│   anvil_runtime          │  │
//! │  │                  │          │                          │  │
//! │  │  • Result codes  │          │  • Devices and memory    │  │
//! │  │  • Object ids    │          │  • Command buffers       │  │
//! │  │  • Allocators    │          │  • Queues and executor   │  │
//! │  │  • Device info   │          │  • Fences and semaphores │  │
//! │  └──────────────────┘          └──────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub use anvil_core as core;
pub use anvil_runtime as runtime;

// Re-export commonly used types
pub use anvil_core::{
    DeviceInfo, HalError, HalResult, HostAllocator, HostMemory, Platform, QueueType, ResultCode,
    SystemAllocator,
};
pub use anvil_runtime::{
    create_devices, Buffer, CommandBuffer, DescriptorInfo, Device, Fence, Kernel, KernelLibrary,
    Memory, MemoryProperties, NdRangeOptions, QueryPool, QueryResult, QueryType, Queue, Semaphore,
    SyncPoint,
};
