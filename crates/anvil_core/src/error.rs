//! # Result Codes and Errors
//!
//! Every HAL operation either succeeds or fails with one code out of a
//! closed set. [`ResultCode`] is that set with its stable numeric values;
//! [`HalError`] is the Rust error carried through `?`, always mappable back
//! to exactly one code.

use thiserror::Error;

/// The closed set of outcome codes.
///
/// The discriminants are part of the external contract and never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResultCode {
    /// The operation succeeded.
    Success = 0,
    /// Generic failure.
    Failure = 1,
    /// A required output was not provided.
    NullOutParameter = 2,
    /// An argument was invalid for this call.
    InvalidValue = 3,
    /// An allocation could not be satisfied.
    OutOfMemory = 4,
    /// An allocator was built from a missing callback.
    NullAllocatorCallback = 5,
    /// A device description was malformed.
    MalformedDeviceEntry = 6,
    /// An executable binary could not be loaded.
    InvalidBinary = 7,
    /// The device does not support the requested feature.
    FeatureUnsupported = 8,
    /// The requested kernel does not exist.
    MissingKernel = 9,
    /// An internal invariant was violated. Never expected.
    Internal = 10,
    /// A fence was signaled by a failed dispatch.
    FenceFailure = 11,
    /// A fence was not signaled within the timeout. Not an error.
    FenceNotReady = 12,
}

impl ResultCode {
    /// Every code, in discriminant order.
    pub const ALL: [Self; 13] = [
        Self::Success,
        Self::Failure,
        Self::NullOutParameter,
        Self::InvalidValue,
        Self::OutOfMemory,
        Self::NullAllocatorCallback,
        Self::MalformedDeviceEntry,
        Self::InvalidBinary,
        Self::FeatureUnsupported,
        Self::MissingKernel,
        Self::Internal,
        Self::FenceFailure,
        Self::FenceNotReady,
    ];

    /// Converts a raw value back into a code.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Returns the raw numeric value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Returns true for [`ResultCode::Success`].
    #[inline]
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true for codes that report a failure.
    ///
    /// `FenceNotReady` is a polling signal, not an error.
    #[inline]
    #[must_use]
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::Success | Self::FenceNotReady)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::NullOutParameter => "null out parameter",
            Self::InvalidValue => "invalid value",
            Self::OutOfMemory => "out of memory",
            Self::NullAllocatorCallback => "null allocator callback",
            Self::MalformedDeviceEntry => "malformed device entry",
            Self::InvalidBinary => "invalid binary",
            Self::FeatureUnsupported => "feature unsupported",
            Self::MissingKernel => "missing kernel",
            Self::Internal => "internal error",
            Self::FenceFailure => "fence failure",
            Self::FenceNotReady => "fence not ready",
        };
        f.write_str(name)
    }
}

/// Errors reported by HAL operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    /// Generic failure, also used for execution-time faults.
    #[error("operation failed: {0}")]
    Failure(String),

    /// A required output was not provided.
    #[error("null out parameter: {0}")]
    NullOutParameter(&'static str),

    /// An argument or object state was invalid for this call.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// An allocation could not be satisfied.
    #[error("out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes requested.
        requested: u64,
        /// Bytes still available when the request was made.
        available: u64,
    },

    /// An allocator was built from a missing callback.
    #[error("allocator callback missing: {0}")]
    NullAllocatorCallback(&'static str),

    /// A device description could not be parsed or is inconsistent.
    #[error("malformed device entry: {0}")]
    MalformedDeviceEntry(String),

    /// An executable binary could not be loaded.
    #[error("invalid binary: {0}")]
    InvalidBinary(String),

    /// The device does not advertise the requested capability.
    #[error("feature unsupported: {0}")]
    FeatureUnsupported(&'static str),

    /// The named kernel does not exist.
    #[error("missing kernel: {0}")]
    MissingKernel(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// The dispatch that owned a fence finished with a failure code.
    #[error("fence signaled by failed dispatch: {0}")]
    FenceFailure(ResultCode),
}

impl HalError {
    /// Shorthand for [`HalError::InvalidValue`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidValue(message.into())
    }

    /// Returns the code this error maps to.
    #[must_use]
    pub const fn code(&self) -> ResultCode {
        match self {
            Self::Failure(_) => ResultCode::Failure,
            Self::NullOutParameter(_) => ResultCode::NullOutParameter,
            Self::InvalidValue(_) => ResultCode::InvalidValue,
            Self::OutOfMemory { .. } => ResultCode::OutOfMemory,
            Self::NullAllocatorCallback(_) => ResultCode::NullAllocatorCallback,
            Self::MalformedDeviceEntry(_) => ResultCode::MalformedDeviceEntry,
            Self::InvalidBinary(_) => ResultCode::InvalidBinary,
            Self::FeatureUnsupported(_) => ResultCode::FeatureUnsupported,
            Self::MissingKernel(_) => ResultCode::MissingKernel,
            Self::Internal(_) => ResultCode::Internal,
            Self::FenceFailure(_) => ResultCode::FenceFailure,
        }
    }
}

impl From<HalError> for ResultCode {
    fn from(error: HalError) -> Self {
        error.code()
    }
}

/// Result type for HAL operations.
pub type HalResult<T> = Result<T, HalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_contiguous() {
        for (index, code) in ResultCode::ALL.iter().enumerate() {
            assert_eq!(code.raw() as usize, index);
            assert_eq!(ResultCode::from_raw(index as u32), Some(*code));
        }
        assert_eq!(ResultCode::from_raw(13), None);
    }

    #[test]
    fn test_not_ready_is_not_an_error() {
        assert!(!ResultCode::FenceNotReady.is_error());
        assert!(!ResultCode::Success.is_error());
        assert!(ResultCode::Internal.is_error());
    }

    #[test]
    fn test_error_maps_to_code() {
        assert_eq!(
            HalError::invalid("bad").code(),
            ResultCode::InvalidValue
        );
        assert_eq!(
            HalError::OutOfMemory { requested: 8, available: 4 }.code(),
            ResultCode::OutOfMemory
        );
        assert_eq!(
            ResultCode::from(HalError::FenceFailure(ResultCode::Failure)),
            ResultCode::FenceFailure
        );
    }
}
