use dataview::Pod;
use strum::FromRepr;

/// Size of a command or reply descriptor.
pub const MSG_DESC_SIZE: usize = 64;

/// Size of a completion descriptor.
pub const COMP_DESC_SIZE: usize = 32;

/// Descriptor ownership.
///
/// The owner byte sits at offset 0 of every descriptor kind and is the
/// synchronization primitive of the whole protocol: only the named
/// side may touch the rest of the descriptor. It is written last, with
/// release semantics, after the body; and read first, with acquire
/// semantics, before the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum Owner {
    Host = 0x55,
    Device = 0xAA,
}

/// Command and reply descriptor.
///
/// The two rings share this layout. A command descriptor's segments
/// describe input data the device will read; a reply descriptor's
/// segments describe a pre-posted buffer the device will later fill.
/// Unused segments have zero length and pointer.
#[repr(C)]
#[derive(Debug, Clone, Pod)]
pub struct MsgDesc {
    /// One of the [`Owner`] discriminants.
    pub owner: u8,
    /// Opaque message type byte, not interpreted by the driver.
    pub ty: u8,
    pub reserved: [u8; 6],
    /// Segment lengths in bytes.
    pub len: [u32; 4],
    /// Host-assigned tag echoed back in the completion.
    pub cookie: u64,
    /// Segment guest-physical addresses.
    pub ptr: [u64; 4],
}

/// Completion descriptor.
#[repr(C)]
#[derive(Debug, Clone, Pod)]
pub struct CompDesc {
    /// One of the [`Owner`] discriminants.
    pub owner: u8,
    /// Reply type byte produced by the device.
    pub ty: u8,
    pub reserved0: [u8; 2],
    /// Full length of the reply message, which may exceed the posted
    /// reply buffer's capacity.
    pub msglen: u32,
    pub reserved1: u64,
    /// Cookie of the command this completion resolves.
    pub cmd_cookie: u64,
    /// Cookie of the reply descriptor the device consumed, or zero
    /// when the command produced no reply.
    pub reply_cookie: u64,
}

const _: () = assert!(size_of::<MsgDesc>() == MSG_DESC_SIZE);
const _: () = assert!(size_of::<CompDesc>() == COMP_DESC_SIZE);
