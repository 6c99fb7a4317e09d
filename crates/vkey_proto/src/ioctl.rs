use bitflags::bitflags;
use dataview::Pod;

/// Maximum number of input or output segments per submission.
pub const NIOV: usize = 4;

/// Capacity of a freshly allocated reply buffer.
///
/// Replies longer than this trigger the bounce protocol: the caller is
/// told the real length and retries, and the driver posts a transient
/// buffer of that size for the retry.
pub const DEFAULT_REPLY_SIZE: usize = 16 * 1024;

bitflags! {
    /// Caller-supplied submission flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(transparent)]
    pub struct SubmitFlags: u32 {
        /// Accept a reply truncated to the output buffers rather than
        /// failing with a buffer-too-small error.
        const TRUNC_OK = 1 << 0;
    }
}

/// Out-parameter of the get-info operation, read straight from the BAR.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod)]
pub struct InfoArg {
    pub vmaj: u32,
    pub vmin: u32,
}

/// Input half of a submission.
///
/// At most [`NIOV`] input segments; the driver never interprets the
/// bytes or the command type.
#[derive(Debug, Clone, Copy)]
pub struct SubmitArgs<'a> {
    pub flags: SubmitFlags,
    pub cmd_type: u8,
    pub input: &'a [&'a [u8]],
}

/// Output half of a submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitReply {
    /// Reply type byte reported by the device.
    pub reply_type: u8,
    /// Full reply length reported by the device, regardless of any
    /// truncation applied while copying out.
    pub rlen: usize,
}
