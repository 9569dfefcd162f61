//! Error taxonomy shared by every fallible entry point.

use ash::vk;

/// Errors surfaced by the runtime.
///
/// All synchronous entry points report failures through this type; nothing
/// is swallowed. Waits with a timeout report the timeout through their
/// boolean return value instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Vulkan is not installed or no device meets the selection criteria.
    #[error("Vulkan is not available: {0}")]
    NotAvailable(String),
    /// A requested capability extension has no suitable device.
    #[error("extension \"{0}\" is not supported by any suitable device")]
    ExtensionUnavailable(String),
    /// An allocation failed because device memory is exhausted.
    #[error("out of device memory")]
    OutOfDeviceMemory,
    /// The device reported an unrecoverable error. Follow-up calls that
    /// need the device are invalid; see [`crate::device_fault_info`] when
    /// the DeviceFault extension is enabled.
    #[error("device lost")]
    DeviceLost,
    /// A caller-provided argument violated a documented contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A sequence builder was used after `submit()`.
    #[error("sequence has already been submitted")]
    AlreadySubmitted,
    /// Any other failure reported by the Vulkan implementation.
    #[error("Vulkan call failed: {0:?}")]
    Platform(vk::Result),
}

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Error::OutOfDeviceMemory,
            vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
            other => Error::Platform(other),
        }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

pub(crate) fn invalid_argument(msg: impl Into<String>) -> Error {
    Error::InvalidArgument(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_results_map_to_distinct_kinds() {
        assert!(matches!(
            Error::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            Error::OutOfDeviceMemory
        ));
        assert!(matches!(
            Error::from(vk::Result::ERROR_DEVICE_LOST),
            Error::DeviceLost
        ));
        assert!(matches!(
            Error::from(vk::Result::ERROR_UNKNOWN),
            Error::Platform(vk::Result::ERROR_UNKNOWN)
        ));
    }
}
