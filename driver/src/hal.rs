//! Platform services the driver is generic over.

use sync_api::{Condvar, Mutex};
use vkey_proto::BarReg;

/// A DMA allocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("DMA allocation of {0} bytes failed")]
pub struct AllocError(pub usize);

/// A DMA-coherent buffer shared with the device.
///
/// The buffer must stay mapped for as long as the value lives and be
/// released on drop. `as_ptr` must be at least 8-byte aligned so
/// descriptors can be accessed in place.
pub trait DmaBuffer: Send {
    /// Guest-physical address the device uses to reach the buffer.
    fn dma_addr(&self) -> u64;

    /// Length of the buffer in bytes.
    fn len(&self) -> usize;

    /// Kernel-virtual mapping of the buffer.
    fn as_ptr(&self) -> *mut u8;

    /// Sync after CPU writes, before the device reads the range.
    fn sync_for_device(&self, offset: usize, len: usize);

    /// Sync before the CPU reads a range the device has written.
    fn sync_for_cpu(&self, offset: usize, len: usize);
}

/// A mapped view of the device's BAR 0 register file.
///
/// Reads and writes must not be reordered or elided; `barrier` orders
/// prior register writes before subsequent ones as observed by the
/// device.
pub trait Bar: Send + Sync {
    fn read_reg(&self, reg: BarReg) -> u32;

    fn write_reg(&self, reg: BarReg, value: u32);

    /// Writes a 64-bit value (ring base addresses).
    fn write_reg64(&self, reg: BarReg, value: u64);

    fn barrier(&self);
}

/// The bundle of platform types and operations a driver instance needs.
pub trait Hal: Send + Sync + Sized + 'static {
    type Mutex<T: Send>: Mutex<Data = T> + Send + Sync;
    type Condvar: Condvar;
    type DmaBuffer: DmaBuffer;
    type Bar: Bar;

    /// Allocates a zeroed DMA-coherent buffer of `len` bytes.
    fn dma_alloc(&self, len: usize) -> Result<Self::DmaBuffer, AllocError>;

    /// Seconds since some fixed point; used to timestamp cookies.
    fn uptime_secs(&self) -> u64;
}
