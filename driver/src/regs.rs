//! Typed view of the BAR 0 register file.

use vkey_proto::{BarReg, DBELL_INDEX_MASK, DBELL_REPLY, DeviceFlags};

use crate::{error::VkeyError, hal::Bar, ring::RingKind};

pub(crate) struct Registers<B> {
    bar: B,
}

impl<B: Bar> Registers<B> {
    pub(crate) fn new(bar: B) -> Self {
        Self { bar }
    }

    pub(crate) fn version(&self) -> (u32, u32) {
        (
            self.bar.read_reg(BarReg::Vmaj),
            self.bar.read_reg(BarReg::Vmin),
        )
    }

    pub(crate) fn flags(&self) -> DeviceFlags {
        DeviceFlags::from_bits_retain(self.bar.read_reg(BarReg::Flags))
    }

    /// Reads the error flags; any fault bit fails the instance.
    pub(crate) fn check_flags(&self) -> Result<(), VkeyError> {
        let flags = self.flags();
        if flags.is_faulted() {
            return Err(VkeyError::DeviceFault(flags));
        }
        Ok(())
    }

    /// Advertises a ring's DMA base address and log2 entry count.
    pub(crate) fn set_ring(&self, kind: RingKind, base: u64, shift: u32) {
        let (base_reg, shift_reg) = match kind {
            RingKind::Cmd => (BarReg::Cbase, BarReg::Cshift),
            RingKind::Reply => (BarReg::Rbase, BarReg::Rshift),
            RingKind::Comp => (BarReg::Cpbase, BarReg::Cpshift),
        };
        self.bar.write_reg64(base_reg, base);
        self.bar.write_reg(shift_reg, shift);
        self.bar.barrier();
    }

    /// Rings the command doorbell for `slot`.
    ///
    /// The caller must have published the descriptor (body, then owner)
    /// already; the bracketing barriers order the ownership transition
    /// before the doorbell as seen by the device.
    pub(crate) fn cmd_doorbell(&self, slot: u32) {
        debug_assert_eq!(slot & !DBELL_INDEX_MASK, 0);
        self.bar.barrier();
        self.bar.write_reg(BarReg::Dbell, slot);
        self.bar.barrier();
    }

    /// Rings the doorbell for a pre-posted reply-ring slot.
    pub(crate) fn reply_doorbell(&self, slot: u32) {
        debug_assert_eq!(slot & !DBELL_INDEX_MASK, 0);
        self.bar.barrier();
        self.bar.write_reg(BarReg::Dbell, DBELL_REPLY | slot);
        self.bar.barrier();
    }

    /// Releases a consumed completion slot back to the device.
    pub(crate) fn comp_doorbell(&self, slot: u32) {
        self.bar.barrier();
        self.bar.write_reg(BarReg::Cpdbell, slot);
        self.bar.barrier();
    }
}
