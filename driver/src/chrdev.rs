//! Character-device surface.
//!
//! The embedder's device table resolves `minor(dev)` through a
//! [`Minors`] registry to an attached instance; an open file holds a
//! reference that keeps the instance drained before release. The only
//! data path is the submit ioctl; read/write are not supported.

use alloc::{collections::BTreeMap, sync::Arc};

use vkey_proto::{DEFAULT_REPLY_SIZE, InfoArg, SubmitArgs, SubmitReply};

use crate::{device::Vkey, error::VkeyError, hal::Hal};

/// Bounce attempts before giving up on an ever-growing reply.
const MAX_BOUNCES: u32 = 5;

/// A character-device minor number.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    derive_more::Display,
    derive_more::From,
)]
pub struct Minor(pub u32);

/// Registry of attached instances, keyed by minor number.
pub struct Minors<H: Hal> {
    devices: BTreeMap<Minor, Arc<Vkey<H>>>,
}

impl<H: Hal> Minors<H> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
        }
    }

    /// Makes an attached instance reachable at `minor`.
    pub fn register(&mut self, minor: Minor, device: Arc<Vkey<H>>) {
        self.devices.insert(minor, device);
    }

    /// The open entry point: resolves the minor and takes a reference
    /// on the instance. Unknown minors and detached instances fail
    /// with [`VkeyError::NoDevice`].
    pub fn open(&self, minor: Minor) -> Result<FileHandle<H>, VkeyError> {
        let device = self.devices.get(&minor).ok_or(VkeyError::NoDevice)?;
        device.open()?;
        Ok(FileHandle {
            device: Arc::clone(device),
        })
    }
}

impl<H: Hal> Default for Minors<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// One open file on a vkey instance. Closing (dropping) the last open
/// file blocks until no command is left in flight.
pub struct FileHandle<H: Hal> {
    device: Arc<Vkey<H>>,
}

impl<H: Hal> core::fmt::Debug for FileHandle<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileHandle").finish_non_exhaustive()
    }
}

impl<H: Hal> FileHandle<H> {
    /// The get-info ioctl.
    pub fn info(&self) -> Result<InfoArg, VkeyError> {
        self.device.info()
    }

    /// The submit ioctl, bouncing enabled: oversize replies the caller
    /// did not accept truncation for are retried with the reported
    /// size, a few times.
    pub fn submit(
        &self,
        args: &SubmitArgs<'_>,
        out: &mut [&mut [u8]],
    ) -> Result<SubmitReply, VkeyError> {
        let mut reply_size = DEFAULT_REPLY_SIZE;
        for _attempt in 0..MAX_BOUNCES {
            match self.device.submit(args, out, reply_size) {
                Err(VkeyError::BufferTooSmall { required }) => {
                    log::debug!("vkey: bouncing with a {required}-byte reply buffer");
                    reply_size = reply_size.max(required);
                }
                other => return other,
            }
        }
        Err(VkeyError::ExcessiveBouncing(MAX_BOUNCES))
    }

    pub fn read(&self, _dst: &mut [u8]) -> Result<usize, VkeyError> {
        Err(VkeyError::NotSupported)
    }

    pub fn write(&self, _src: &[u8]) -> Result<usize, VkeyError> {
        Err(VkeyError::NotSupported)
    }
}

impl<H: Hal> Drop for FileHandle<H> {
    fn drop(&mut self) {
        self.device.close();
    }
}
