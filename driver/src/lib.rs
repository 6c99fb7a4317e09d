//! Host-side driver for the vkey virtual cryptographic-key coprocessor.
//!
//! The device accepts variable-length opaque command messages and
//! returns variable-length replies by DMA, over three single-producer
//! rings (command, reply, completion) whose descriptors carry an owner
//! byte as the handoff primitive. This crate implements the whole
//! request lifecycle: descriptor rings, cookie bookkeeping, the
//! reply-buffer pool with oversize bouncing, the blocking submit path,
//! and the completion interrupt handler.
//!
//! Platform services (DMA memory, BAR access, locking, interrupt
//! wiring) are supplied through the [`Hal`] trait, so the driver runs
//! unchanged against real bus glue or against the software device used
//! by the test suite. PCI enumeration, BAR mapping and MSI-X vector
//! provisioning are the embedder's problem: it hands `attach` a mapped
//! [`Bar`] and later arranges for [`Vkey::handle_interrupt`] to run on
//! the device's vector.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod chrdev;
mod cookie;
mod device;
mod error;
mod hal;
mod pool;
mod regs;
mod ring;

pub use vkey_proto as proto;

pub use self::{
    chrdev::{FileHandle, Minor, Minors},
    device::{PoolStats, RingConfig, Vkey},
    error::VkeyError,
    hal::{AllocError, Bar, DmaBuffer, Hal},
};
