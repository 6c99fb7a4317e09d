use bitflags::bitflags;

/// Size of BAR 0. The register file must map to exactly this many bytes.
pub const BAR0_SIZE: usize = 0x80;

/// BAR 0 register offsets.
///
/// Each ring is described by a 64-bit DMA base address followed by a
/// 32-bit shift (log2 of the entry count) at base + 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum BarReg {
    /// Protocol major version - R
    Vmaj = 0x00,
    /// Protocol minor version - R
    Vmin = 0x04,
    /// Device error state - RW, see [`DeviceFlags`]
    Flags = 0x08,
    /// Command ring DMA base - W
    Cbase = 0x10,
    /// Command ring log2 entry count - W
    Cshift = 0x18,
    /// Reply ring DMA base - W
    Rbase = 0x20,
    /// Reply ring log2 entry count - W
    Rshift = 0x28,
    /// Completion ring DMA base - W
    Cpbase = 0x30,
    /// Completion ring log2 entry count - W
    Cpshift = 0x38,
    /// Command/reply doorbell - W
    Dbell = 0x40,
    /// Completion-return doorbell - W
    Cpdbell = 0x44,
}

impl BarReg {
    /// Byte offset of the register within BAR 0.
    #[must_use]
    pub fn offset(self) -> usize {
        self as usize
    }
}

/// Set in a [`BarReg::Dbell`] write when the index names a reply-ring
/// slot being pre-posted; clear for a command-ring slot.
pub const DBELL_REPLY: u32 = 1 << 31;

/// Low bits of a doorbell write: the descriptor index.
pub const DBELL_INDEX_MASK: u32 = DBELL_REPLY - 1;

bitflags! {
    /// Device-reported error state in [`BarReg::Flags`].
    ///
    /// Any set bit other than [`DeviceFlags::RST`] means the device has
    /// failed; the driver treats the instance as detached from then on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct DeviceFlags: u32 {
        /// Device fault reading an address taken from the BAR.
        const FLTB = 1 << 0;
        /// Device fault reading a ring.
        const FLTR = 1 << 1;
        /// Command dropped: insufficient posted reply buffers.
        const DROP = 1 << 2;
        /// Owner or completion-doorbell mismatch.
        const OVF = 1 << 3;
        /// Operation out of sequence.
        const SEQ = 1 << 4;
        /// Miscellaneous hardware error.
        const HWERR = 1 << 16;
        /// Writable reset trigger.
        const RST = 1 << 31;
    }
}

impl DeviceFlags {
    /// True when any fault bit is set.
    #[must_use]
    pub fn is_faulted(self) -> bool {
        !self.difference(Self::RST).is_empty()
    }
}
