use sync_api::WaitError;
use vkey_proto::DeviceFlags;

use crate::hal::AllocError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VkeyError {
    /// The instance is absent or has been marked detached.
    #[error("no such device")]
    NoDevice,
    /// The device speaks a protocol major version we do not.
    #[error("unsupported protocol version {0}")]
    BadVersion(u32),
    /// A blocking wait was broken by a signal before completion.
    #[error("interrupted by a signal")]
    Interrupted,
    /// The command cookie counter reached the reply-cookie range.
    #[error("command cookie space exhausted")]
    CookieOverflow,
    #[error(transparent)]
    AllocFailed(#[from] AllocError),
    /// More input or output segments than descriptors can carry.
    #[error("too many I/O segments")]
    TooManySegments,
    /// The reply did not fit the posted buffer and the caller did not
    /// accept truncation. `required` is the bounce size to retry with.
    #[error("reply of {required} bytes exceeds the posted buffer")]
    BufferTooSmall { required: usize },
    /// The reply kept outgrowing the bounce buffer.
    #[error("reply still oversize after {0} bounce attempts")]
    ExcessiveBouncing(u32),
    /// The device reported a fault; the instance is now detached.
    #[error("device fault (flags {0:?})")]
    DeviceFault(DeviceFlags),
    /// A descriptor or cookie invariant did not hold; the instance is
    /// now detached.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    /// The instance detached while the request was in flight.
    #[error("input/output error")]
    Io,
    /// read/write on the character device.
    #[error("operation not supported")]
    NotSupported,
}

impl From<WaitError> for VkeyError {
    fn from(error: WaitError) -> Self {
        match error {
            WaitError::Interrupted => Self::Interrupted,
        }
    }
}
