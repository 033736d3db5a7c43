//! # Kernel Argument Descriptors
//!
//! A [`DescriptorInfo`] describes one argument bound to an ND-range command.
//! Buffer and image descriptors capture the object's memory binding when they
//! are built, so the object must already be bound.

use anvil_core::{HalError, HalResult, ObjectId};
use bytemuck::Pod;

use crate::kernel::{BufferView, ImageView, KernelArg, LocalView};
use crate::memory::{Buffer, BufferBinding, Image, ImageBinding, SamplerDesc};

/// A bound buffer captured for use as a kernel argument.
#[derive(Clone, Debug)]
pub struct BufferDescriptor {
    device: ObjectId,
    binding: BufferBinding,
}

impl BufferDescriptor {
    /// Id of the described buffer.
    #[must_use]
    pub fn buffer_id(&self) -> ObjectId {
        self.binding.buffer
    }
}

/// A bound image captured for use as a kernel argument.
#[derive(Clone, Debug)]
pub struct ImageDescriptor {
    device: ObjectId,
    binding: ImageBinding,
}

impl ImageDescriptor {
    /// Id of the described image.
    #[must_use]
    pub fn image_id(&self) -> ObjectId {
        self.binding.image
    }
}

/// Discriminant of a [`DescriptorInfo`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Buffer argument.
    Buffer,
    /// Image argument.
    Image,
    /// Sampler argument.
    Sampler,
    /// Inline bytes.
    PlainOldData,
    /// Local memory allocation.
    SharedLocalBuffer,
    /// Null buffer.
    NullBuffer,
    /// Backend-defined bytes.
    Custom,
}

/// One kernel argument binding.
#[derive(Clone, Debug)]
pub enum DescriptorInfo {
    /// A bound buffer.
    Buffer(BufferDescriptor),
    /// A bound image.
    Image(ImageDescriptor),
    /// Sampler state.
    Sampler(SamplerDesc),
    /// Inline bytes passed by value.
    PlainOldData(Vec<u8>),
    /// Per-work-group scratch memory of the given size in bytes.
    SharedLocalBuffer(usize),
    /// A null buffer argument.
    NullBuffer,
    /// Backend-defined bytes.
    Custom(Vec<u8>),
}

impl DescriptorInfo {
    /// Describes a bound buffer.
    pub fn buffer(buffer: &Buffer) -> HalResult<Self> {
        Ok(Self::Buffer(BufferDescriptor {
            device: buffer.device_id(),
            binding: buffer.binding()?.clone(),
        }))
    }

    /// Describes a bound image.
    pub fn image(image: &Image) -> HalResult<Self> {
        Ok(Self::Image(ImageDescriptor {
            device: image.device_id(),
            binding: image.binding()?.clone(),
        }))
    }

    /// Passes `value` by value.
    #[must_use]
    pub fn plain<T: Pod>(value: &T) -> Self {
        Self::PlainOldData(bytemuck::bytes_of(value).to_vec())
    }

    /// Requests `size` bytes of local memory.
    #[must_use]
    pub const fn local(size: usize) -> Self {
        Self::SharedLocalBuffer(size)
    }

    /// The variant's discriminant.
    #[must_use]
    pub const fn kind(&self) -> DescriptorKind {
        match self {
            Self::Buffer(_) => DescriptorKind::Buffer,
            Self::Image(_) => DescriptorKind::Image,
            Self::Sampler(_) => DescriptorKind::Sampler,
            Self::PlainOldData(_) => DescriptorKind::PlainOldData,
            Self::SharedLocalBuffer(_) => DescriptorKind::SharedLocalBuffer,
            Self::NullBuffer => DescriptorKind::NullBuffer,
            Self::Custom(_) => DescriptorKind::Custom,
        }
    }

    /// Device owning the referenced object, if any.
    pub(crate) fn device(&self) -> Option<ObjectId> {
        match self {
            Self::Buffer(descriptor) => Some(descriptor.device),
            Self::Image(descriptor) => Some(descriptor.device),
            _ => None,
        }
    }

    /// Checks that `replacement` may take this descriptor's place.
    ///
    /// Buffer slots accept null buffers and vice versa; inline data must
    /// keep its size.
    pub(crate) fn check_replacement(&self, replacement: &Self) -> HalResult<()> {
        let compatible = match (self, replacement) {
            (Self::Buffer(_) | Self::NullBuffer, Self::Buffer(_) | Self::NullBuffer) => true,
            (Self::PlainOldData(old), Self::PlainOldData(new)) => old.len() == new.len(),
            (old, new) => old.kind() == new.kind(),
        };
        if compatible {
            Ok(())
        } else {
            Err(HalError::invalid(format!(
                "descriptor {:?} cannot replace {:?}",
                replacement.kind(),
                self.kind()
            )))
        }
    }

    /// Resolves the descriptor for one work group. Local buffers are
    /// allocated fresh on every call.
    pub(crate) fn resolve(&self) -> KernelArg {
        match self {
            Self::Buffer(descriptor) => KernelArg::Buffer(BufferView::new(descriptor.binding.clone())),
            Self::Image(descriptor) => KernelArg::Image(ImageView::new(descriptor.binding.clone())),
            Self::Sampler(desc) => KernelArg::Sampler(*desc),
            Self::PlainOldData(bytes) => KernelArg::PlainOldData(bytes.clone()),
            Self::SharedLocalBuffer(size) => KernelArg::Local(LocalView::zeroed(*size)),
            Self::NullBuffer => KernelArg::Null,
            Self::Custom(bytes) => KernelArg::Custom(bytes.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::ResultCode;

    #[test]
    fn test_plain_captures_bytes() {
        let descriptor = DescriptorInfo::plain(&0x0102_0304u32);
        assert_eq!(descriptor.kind(), DescriptorKind::PlainOldData);
        match descriptor.resolve() {
            KernelArg::PlainOldData(bytes) => assert_eq!(bytes, vec![4, 3, 2, 1]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_replacement_rules() {
        let plain = DescriptorInfo::plain(&1u32);
        plain.check_replacement(&DescriptorInfo::plain(&2u32)).unwrap();

        let err = plain.check_replacement(&DescriptorInfo::plain(&2u64)).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidValue);

        let err = plain.check_replacement(&DescriptorInfo::local(16)).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidValue);

        DescriptorInfo::local(8)
            .check_replacement(&DescriptorInfo::local(64))
            .unwrap();
    }

    #[test]
    fn test_local_is_fresh_per_resolve() {
        let descriptor = DescriptorInfo::local(4);
        let KernelArg::Local(first) = descriptor.resolve() else {
            panic!("expected local");
        };
        first.write(0, 9u32).unwrap();
        let KernelArg::Local(second) = descriptor.resolve() else {
            panic!("expected local");
        };
        assert_eq!(second.read::<u32>(0).unwrap(), 0);
    }
}
