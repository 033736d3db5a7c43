//! # Object Identity
//!
//! Every HAL object carries a 32-bit identifier:
//! - Upper 16 bits: object type tag
//! - Lower 16 bits: per-device serial number
//!
//! The layout is part of the external contract and must stay bit-exact.

use std::sync::atomic::{AtomicU32, Ordering};

/// Number of bits the type tag is shifted by.
pub const OBJECT_TYPE_SHIFT: u32 = 16;

/// Mask selecting the serial portion of an id.
pub const OBJECT_SERIAL_MASK: u32 = (1 << OBJECT_TYPE_SHIFT) - 1;

/// Object type tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ObjectType {
    /// A buffer.
    Buffer = 1,
    /// A command buffer.
    CommandBuffer = 2,
    /// A device.
    Device = 3,
    /// An executable.
    Executable = 4,
    /// An image.
    Image = 5,
    /// A kernel.
    Kernel = 6,
    /// A device memory allocation.
    Memory = 7,
    /// A queue.
    Queue = 8,
    /// A sampler.
    Sampler = 9,
    /// A semaphore.
    Semaphore = 10,
    /// A query pool.
    QueryPool = 11,
    /// A sync-point.
    SyncPoint = 12,
    /// A fence.
    Fence = 13,
}

impl ObjectType {
    /// Converts a raw tag into a type.
    #[must_use]
    pub const fn from_tag(tag: u16) -> Option<Self> {
        Some(match tag {
            1 => Self::Buffer,
            2 => Self::CommandBuffer,
            3 => Self::Device,
            4 => Self::Executable,
            5 => Self::Image,
            6 => Self::Kernel,
            7 => Self::Memory,
            8 => Self::Queue,
            9 => Self::Sampler,
            10 => Self::Semaphore,
            11 => Self::QueryPool,
            12 => Self::SyncPoint,
            13 => Self::Fence,
            _ => return None,
        })
    }
}

/// Packed object identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectId(u32);

impl ObjectId {
    /// Creates an id from a type and a serial (truncated to 16 bits).
    #[inline]
    #[must_use]
    pub const fn new(object_type: ObjectType, serial: u32) -> Self {
        Self(((object_type as u32) << OBJECT_TYPE_SHIFT) | (serial & OBJECT_SERIAL_MASK))
    }

    /// Reinterprets a raw value. Returns `None` if the tag is unknown.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match ObjectType::from_tag((raw >> OBJECT_TYPE_SHIFT) as u16) {
            Some(_) => Some(Self(raw)),
            None => None,
        }
    }

    /// Returns the raw packed value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns the type tag.
    #[inline]
    #[must_use]
    pub const fn tag(self) -> u16 {
        (self.0 >> OBJECT_TYPE_SHIFT) as u16
    }

    /// Returns the object type.
    #[must_use]
    pub const fn object_type(self) -> Option<ObjectType> {
        ObjectType::from_tag(self.tag())
    }

    /// Returns the serial portion.
    #[inline]
    #[must_use]
    pub const fn serial(self) -> u32 {
        self.0 & OBJECT_SERIAL_MASK
    }

    /// Returns true if the id carries the given type tag.
    #[inline]
    #[must_use]
    pub const fn is(self, object_type: ObjectType) -> bool {
        self.tag() == object_type as u16
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Hands out ids for one object type.
///
/// Serials wrap after 2^16 objects; ids are identities for diagnostics and
/// ownership checks, not unique keys across a device's whole lifetime.
#[derive(Debug)]
pub struct IdAllocator {
    object_type: ObjectType,
    next: AtomicU32,
}

impl IdAllocator {
    /// Creates an allocator for the given type.
    #[must_use]
    pub const fn new(object_type: ObjectType) -> Self {
        Self {
            object_type,
            next: AtomicU32::new(0),
        }
    }

    /// Returns the next id.
    pub fn next(&self) -> ObjectId {
        let serial = self.next.fetch_add(1, Ordering::Relaxed);
        ObjectId::new(self.object_type, serial)
    }
}
