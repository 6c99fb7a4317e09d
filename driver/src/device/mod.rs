//! One attached vkey instance.

mod intr;
mod submit;

use alloc::sync::Arc;

use sync_api::{Condvar, Mutex};
use vkey_proto::{DeviceFlags, InfoArg, VERSION_MAJOR};

use crate::{
    cookie::{CookieGen, CookieTable},
    error::VkeyError,
    hal::Hal,
    pool::ReplyPool,
    regs::Registers,
    ring::{Ring, RingKind},
};

/// Ring sizing, fixed at attach time.
///
/// The reply and completion rings must hold at least as many entries
/// as the command ring: every in-flight command pins one posted reply
/// descriptor and eventually one completion slot.
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// log2 of the command ring entry count.
    pub cmd_shift: u32,
    /// log2 of the reply ring entry count.
    pub reply_shift: u32,
    /// log2 of the completion ring entry count.
    pub comp_shift: u32,
}

impl RingConfig {
    /// The same shift for all three rings.
    #[must_use]
    pub fn uniform(shift: u32) -> Self {
        Self {
            cmd_shift: shift,
            reply_shift: shift,
            comp_shift: shift,
        }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self::uniform(5)
    }
}

/// Snapshot of the reply-pool counters, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Commands between submit and epilogue.
    pub n_cmd: u32,
    /// Posted reply descriptors not earmarked for a command.
    pub n_free: u32,
}

/// Everything the instance mutex protects.
pub(crate) struct State<H: Hal> {
    pub(crate) cmd_ring: Ring<H::DmaBuffer>,
    pub(crate) reply_ring: Ring<H::DmaBuffer>,
    pub(crate) comp_ring: Ring<H::DmaBuffer>,
    pub(crate) cookies: CookieTable<H>,
    pub(crate) cookie_gen: CookieGen,
    pub(crate) pool: ReplyPool,
    /// Reply buffer allocated with the lock released, waiting to be
    /// posted once the counters have been re-verified.
    pub(crate) pending_reply: Option<H::DmaBuffer>,
    pub(crate) detached: bool,
    pub(crate) opens: u32,
}

type StateMutex<H> = <H as Hal>::Mutex<State<H>>;

/// An attached vkey device.
///
/// All shared mutable state sits behind one mutex; the completion
/// handler takes the same mutex, so every descriptor whose owner is
/// HOST is only ever touched under it.
pub struct Vkey<H: Hal> {
    pub(crate) hal: H,
    pub(crate) regs: Registers<H::Bar>,
    pub(crate) state: StateMutex<H>,
    /// Signalled whenever `n_cmd` drops or the instance detaches.
    pub(crate) cmd_available: H::Condvar,
}

impl<H: Hal> Vkey<H> {
    /// Brings up an instance on a mapped BAR: checks the protocol
    /// version, allocates and advertises the three rings, and verifies
    /// the device reported no fault doing so.
    pub fn attach(hal: H, bar: H::Bar, config: RingConfig) -> Result<Arc<Self>, VkeyError> {
        assert!(
            config.reply_shift >= config.cmd_shift && config.comp_shift >= config.cmd_shift,
            "reply and completion rings must not be smaller than the command ring"
        );
        let regs = Registers::new(bar);

        let (vmaj, vmin) = regs.version();
        if vmaj != VERSION_MAJOR {
            log::error!("vkey: unsupported device version {vmaj}.{vmin}");
            return Err(VkeyError::BadVersion(vmaj));
        }
        regs.check_flags()?;

        let cmd_ring = Self::alloc_ring(&hal, RingKind::Cmd, config.cmd_shift)?;
        let reply_ring = Self::alloc_ring(&hal, RingKind::Reply, config.reply_shift)?;
        let comp_ring = Self::alloc_ring(&hal, RingKind::Comp, config.comp_shift)?;

        regs.set_ring(RingKind::Cmd, cmd_ring.dma_addr(), cmd_ring.shift());
        regs.set_ring(RingKind::Reply, reply_ring.dma_addr(), reply_ring.shift());
        regs.set_ring(RingKind::Comp, comp_ring.dma_addr(), comp_ring.shift());
        regs.check_flags()?;

        log::info!(
            "vkey: attached, device version {vmaj}.{vmin}, rings cmd/reply/comp = {}/{}/{} entries",
            cmd_ring.entries(),
            reply_ring.entries(),
            comp_ring.entries(),
        );

        let pool = ReplyPool::new(cmd_ring.entries(), reply_ring.entries());
        let state = State {
            cmd_ring,
            reply_ring,
            comp_ring,
            cookies: CookieTable::new(),
            cookie_gen: CookieGen::new(vkey_proto::COOKIE_START),
            pool,
            pending_reply: None,
            detached: false,
            opens: 0,
        };

        Ok(Arc::new(Self {
            hal,
            regs,
            state: <StateMutex<H> as Mutex>::new(state),
            cmd_available: <H::Condvar as Condvar>::new(),
        }))
    }

    fn alloc_ring(hal: &H, kind: RingKind, shift: u32) -> Result<Ring<H::DmaBuffer>, VkeyError> {
        let len = (1_usize << shift) * kind.desc_size();
        let buf = hal.dma_alloc(len)?;
        Ok(Ring::new(kind, buf, shift))
    }

    /// The get-info operation: protocol version straight from the BAR.
    pub fn info(&self) -> Result<InfoArg, VkeyError> {
        if self.state.lock().detached {
            return Err(VkeyError::NoDevice);
        }
        let (vmaj, vmin) = self.regs.version();
        let flags = self.regs.flags();
        if flags.is_faulted() {
            let mut guard = self.state.lock();
            return Err(self.device_fault(&mut guard, flags));
        }
        Ok(InfoArg { vmaj, vmin })
    }

    /// Current reply-pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        let guard = self.state.lock();
        PoolStats {
            n_cmd: guard.pool.n_cmd(),
            n_free: guard.pool.n_free(),
        }
    }

    /// Whether the instance has been marked detached.
    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    /// References the instance for an opening file. Embedders that do
    /// not use the [`crate::Minors`] registry call this from their own
    /// open entry point.
    pub fn open(&self) -> Result<(), VkeyError> {
        let mut guard = self.state.lock();
        if guard.detached {
            return Err(VkeyError::NoDevice);
        }
        guard.opens += 1;
        Ok(())
    }

    /// Closes one reference. The last close drains: no in-flight
    /// command may outlive the file, so this blocks (uninterruptibly)
    /// until `n_cmd` reaches zero. Never fails; internal trouble is
    /// logged and swallowed.
    pub fn close(&self) {
        let mut guard = self.state.lock();
        if guard.opens == 0 {
            log::error!("vkey: close without open");
            return;
        }
        guard.opens -= 1;
        if guard.opens > 0 {
            return;
        }
        while guard.pool.n_cmd() > 0 && !guard.detached {
            guard = self.cmd_available.wait(&self.state, guard);
        }
    }

    /// Marks the instance detached: fails every in-flight command and
    /// wakes everything. All later operations see `detached`.
    pub(crate) fn detach_locked(&self, state: &mut State<H>) {
        if state.detached {
            return;
        }
        state.detached = true;
        state.cookies.fail_all_cmds(self.hal.uptime_secs());
        self.cmd_available.notify_all();
    }

    pub(crate) fn device_fault(&self, state: &mut State<H>, flags: DeviceFlags) -> VkeyError {
        log::error!("vkey: device fault, flags {flags:?}; detaching");
        self.detach_locked(state);
        VkeyError::DeviceFault(flags)
    }

    pub(crate) fn protocol_violation(
        &self,
        state: &mut State<H>,
        what: &'static str,
    ) -> VkeyError {
        log::error!("vkey: protocol violation: {what}; detaching");
        self.detach_locked(state);
        VkeyError::Protocol(what)
    }
}
