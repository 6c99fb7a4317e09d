//! Wire protocol and ABI definitions for the vkey coprocessor.
//!
//! Everything the device and the driver must agree on lives here: the
//! BAR register map, the three descriptor layouts, the doorbell
//! encoding, and the ioctl argument shapes. The driver proper and the
//! software device used by its tests both build on this crate.

#![no_std]

mod bar;
mod ioctl;
mod wire;

pub use self::{
    bar::{BAR0_SIZE, BarReg, DBELL_INDEX_MASK, DBELL_REPLY, DeviceFlags},
    ioctl::{DEFAULT_REPLY_SIZE, InfoArg, NIOV, SubmitArgs, SubmitFlags, SubmitReply},
    wire::{COMP_DESC_SIZE, CompDesc, MSG_DESC_SIZE, MsgDesc, Owner},
};

/// PCI vendor id of the vkey coprocessor.
pub const PCI_VENDOR_ID: u16 = 0x3301;

/// PCI product id of the vkey coprocessor.
pub const PCI_PRODUCT_ID: u16 = 0x0200;

/// Protocol major version the driver speaks.
pub const VERSION_MAJOR: u32 = 1;

/// First value handed out by either cookie generator.
pub const COOKIE_START: u64 = 1000;

/// Offset added to reply cookies.
///
/// Command cookies stay below this value, so the two kinds occupy
/// disjoint ranges and a raw cookie value can never be mistaken for
/// the other kind. A command generator reaching this value has
/// overflowed.
pub const REPLY_COOKIE_BASE: u64 = 10_000_000_000_000_000_000;
