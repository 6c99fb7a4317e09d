//! Descriptor ring memory.
//!
//! Each ring is a DMA-coherent array of `2^shift` fixed-size
//! descriptors. The first byte of every descriptor is its owner field;
//! a descriptor may only be read or written by the side named there.
//! Ownership transfers are release-stores paired with acquire-loads,
//! on top of the buffer's DMA sync hooks, so the descriptor body is
//! visible before the owner transition and the transition before the
//! doorbell the caller rings afterwards.

use core::sync::atomic::{AtomicU8, Ordering};

use dataview::{Pod, PodMethods as _};
use vkey_proto::{COMP_DESC_SIZE, MSG_DESC_SIZE, Owner};

use crate::hal::DmaBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RingKind {
    Cmd,
    Reply,
    Comp,
}

impl RingKind {
    pub(crate) fn desc_size(self) -> usize {
        match self {
            Self::Cmd | Self::Reply => MSG_DESC_SIZE,
            Self::Comp => COMP_DESC_SIZE,
        }
    }

    /// Owner every descriptor starts out with: the host posts into the
    /// command and reply rings, the device produces into the
    /// completion ring.
    fn initial_owner(self) -> Owner {
        match self {
            Self::Cmd | Self::Reply => Owner::Host,
            Self::Comp => Owner::Device,
        }
    }
}

pub(crate) struct Ring<B> {
    kind: RingKind,
    buf: B,
    shift: u32,
    head: u32,
}

impl<B: DmaBuffer> Ring<B> {
    /// Wraps `buf` as a ring of `2^shift` descriptors and initializes
    /// every owner byte.
    pub(crate) fn new(kind: RingKind, buf: B, shift: u32) -> Self {
        let ring = Self {
            kind,
            buf,
            shift,
            head: 0,
        };
        assert_eq!(ring.buf.len(), ring.entries() as usize * kind.desc_size());

        let owner = kind.initial_owner();
        for slot in 0..ring.entries() {
            // Not yet shared with the device; plain volatile stores do.
            unsafe {
                ring.slot_ptr(slot).write_volatile(owner as u8);
            }
        }
        ring.buf.sync_for_device(0, ring.buf.len());
        ring
    }

    pub(crate) fn entries(&self) -> u32 {
        1 << self.shift
    }

    pub(crate) fn shift(&self) -> u32 {
        self.shift
    }

    pub(crate) fn dma_addr(&self) -> u64 {
        self.buf.dma_addr()
    }

    /// The slot the next allocation (CMD, REPLY) or consumption (COMP)
    /// will use.
    pub(crate) fn head_slot(&self) -> u32 {
        self.head & (self.entries() - 1)
    }

    /// Advances the head, returning the slot it covered.
    pub(crate) fn advance(&mut self) -> u32 {
        let slot = self.head_slot();
        self.head = self.head.wrapping_add(1);
        slot
    }

    fn slot_ptr(&self, slot: u32) -> *mut u8 {
        debug_assert!(slot < self.entries());
        let offset = slot as usize * self.kind.desc_size();
        // In-bounds by the length assert in `new`.
        unsafe { self.buf.as_ptr().add(offset) }
    }

    fn owner_atomic(&self, slot: u32) -> &AtomicU8 {
        // The owner byte is the first byte of the descriptor;
        // AtomicU8 has the same layout and no alignment demands.
        unsafe { &*self.slot_ptr(slot).cast::<AtomicU8>() }
    }

    /// Reads the owner byte of `slot` with acquire semantics.
    pub(crate) fn owner(&self, slot: u32) -> Option<Owner> {
        self.buf
            .sync_for_cpu(slot as usize * self.kind.desc_size(), 1);
        Owner::from_repr(self.owner_atomic(slot).load(Ordering::Acquire))
    }

    /// Reads the descriptor at `slot`.
    ///
    /// Only valid once `owner` returned [`Owner::Host`].
    pub(crate) fn read_desc<T: Pod>(&self, slot: u32) -> T {
        let size = self.kind.desc_size();
        debug_assert_eq!(size_of::<T>(), size);
        self.buf.sync_for_cpu(slot as usize * size, size);

        let mut desc = T::zeroed();
        let src = self.slot_ptr(slot);
        for (index, byte) in desc.as_bytes_mut().iter_mut().enumerate() {
            *byte = unsafe { src.add(index).read_volatile() };
        }
        desc
    }

    /// Writes the descriptor at `slot`: body first, then the owner byte
    /// taken from `desc`, with a release fence in between.
    ///
    /// The caller must hold ownership (`owner` == [`Owner::Host`]) and
    /// ring the doorbell afterwards when handing the slot over.
    pub(crate) fn write_desc<T: Pod>(&mut self, slot: u32, desc: &T) {
        let size = self.kind.desc_size();
        debug_assert_eq!(size_of::<T>(), size);

        let bytes = desc.as_bytes();
        let dst = self.slot_ptr(slot);
        for (index, byte) in bytes.iter().enumerate().skip(1) {
            unsafe {
                dst.add(index).write_volatile(*byte);
            }
        }
        self.buf.sync_for_device(slot as usize * size, size);
        self.owner_atomic(slot).store(bytes[0], Ordering::Release);
        self.buf.sync_for_device(slot as usize * size, 1);
    }

    /// Transfers ownership of `slot` without touching the body (used to
    /// return consumed completion slots).
    pub(crate) fn set_owner(&mut self, slot: u32, owner: Owner) {
        self.owner_atomic(slot).store(owner as u8, Ordering::Release);
        self.buf
            .sync_for_device(slot as usize * self.kind.desc_size(), 1);
    }
}
