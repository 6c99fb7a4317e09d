//! A software vkey coprocessor for exercising the driver end to end.
//!
//! The device owns a flat guest-memory arena the mock HAL allocates
//! DMA buffers from, so it sees the rings exactly as a real device
//! would: it latches commands when the doorbell rings (returning the
//! command slot to the host), pairs them with pre-posted reply
//! descriptors in posting order, and writes completions from a worker
//! thread that then raises "MSI-X" by calling the driver's interrupt
//! handler.

#![allow(dead_code)]

use std::{
    cell::UnsafeCell,
    collections::VecDeque,
    sync::{
        Arc, Condvar as StdCondvar, Mutex as StdMutex,
        atomic::{AtomicU8, AtomicUsize, Ordering, fence},
    },
    thread,
    time::{Duration, Instant},
};

use sync_api::host::{HostCondvar, HostMutex};
use vkey_driver::{AllocError, Bar, DmaBuffer, Hal, RingConfig, Vkey};
use vkey_driver::proto::{
    BarReg, COMP_DESC_SIZE, CompDesc, DBELL_INDEX_MASK, DBELL_REPLY, DeviceFlags, MSG_DESC_SIZE,
    MsgDesc, Owner,
};

/// Base guest-physical address of the arena, so offsets and addresses
/// cannot be confused.
const PADDR_BASE: u64 = 0x4000_0000;

const ARENA_SIZE: usize = 64 << 20;

// ---------------------------------------------------------------- arena

pub struct GuestMem {
    // u64 storage keeps descriptor addresses 8-byte aligned.
    words: UnsafeCell<Box<[u64]>>,
    cursor: StdMutex<usize>,
}

// Concurrent access is synchronized by the descriptor owner protocol,
// exactly as on real hardware.
unsafe impl Send for GuestMem {}
unsafe impl Sync for GuestMem {}

impl GuestMem {
    pub fn new() -> Self {
        Self {
            words: UnsafeCell::new(vec![0; ARENA_SIZE / 8].into_boxed_slice()),
            cursor: StdMutex::new(0),
        }
    }

    fn alloc(&self, len: usize) -> u64 {
        let mut cursor = self.cursor.lock().unwrap();
        let offset = cursor.next_multiple_of(64);
        assert!(offset + len <= ARENA_SIZE, "guest arena exhausted");
        *cursor = offset + len;
        PADDR_BASE + offset as u64
    }

    fn ptr(&self, paddr: u64) -> *mut u8 {
        let offset = usize::try_from(paddr - PADDR_BASE).unwrap();
        assert!(offset < ARENA_SIZE, "paddr {paddr:#x} outside the arena");
        unsafe { (*self.words.get()).as_mut_ptr().cast::<u8>().add(offset) }
    }
}

fn owner_at(mem: &GuestMem, paddr: u64) -> Option<Owner> {
    let atomic = unsafe { &*mem.ptr(paddr).cast::<AtomicU8>() };
    Owner::from_repr(atomic.load(Ordering::Acquire))
}

fn set_owner_at(mem: &GuestMem, paddr: u64, owner: Owner) {
    let atomic = unsafe { &*mem.ptr(paddr).cast::<AtomicU8>() };
    atomic.store(owner as u8, Ordering::Release);
}

/// Reads a whole descriptor. Valid only after `owner_at` said we own it.
unsafe fn read_desc<T>(mem: &GuestMem, paddr: u64) -> T {
    unsafe { mem.ptr(paddr).cast::<T>().read_volatile() }
}

/// Writes a descriptor body (everything but the owner byte).
unsafe fn write_desc_body(mem: &GuestMem, paddr: u64, bytes: &[u8]) {
    let dst = mem.ptr(paddr);
    for (index, byte) in bytes.iter().enumerate().skip(1) {
        unsafe {
            dst.add(index).write_volatile(*byte);
        }
    }
    fence(Ordering::Release);
}

fn read_bytes(mem: &GuestMem, paddr: u64, len: usize) -> Vec<u8> {
    fence(Ordering::Acquire);
    let src = mem.ptr(paddr);
    (0..len)
        .map(|index| unsafe { src.add(index).read_volatile() })
        .collect()
}

fn write_bytes(mem: &GuestMem, paddr: u64, bytes: &[u8]) {
    let dst = mem.ptr(paddr);
    for (index, byte) in bytes.iter().enumerate() {
        unsafe {
            dst.add(index).write_volatile(*byte);
        }
    }
    fence(Ordering::Release);
}

// ---------------------------------------------------------------- HAL

#[derive(Clone)]
pub struct MockHal {
    mem: Arc<GuestMem>,
    epoch: Instant,
    dma_allocs: Arc<AtomicUsize>,
}

impl MockHal {
    pub fn new(mem: Arc<GuestMem>) -> Self {
        Self {
            mem,
            epoch: Instant::now(),
            dma_allocs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// DMA allocations made so far (rings, inputs, reply buffers).
    pub fn dma_alloc_count(&self) -> usize {
        self.dma_allocs.load(Ordering::SeqCst)
    }
}

pub struct MockDmaBuffer {
    mem: Arc<GuestMem>,
    paddr: u64,
    len: usize,
}

impl DmaBuffer for MockDmaBuffer {
    fn dma_addr(&self) -> u64 {
        self.paddr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn as_ptr(&self) -> *mut u8 {
        self.mem.ptr(self.paddr)
    }

    fn sync_for_device(&self, _offset: usize, _len: usize) {
        fence(Ordering::SeqCst);
    }

    fn sync_for_cpu(&self, _offset: usize, _len: usize) {
        fence(Ordering::SeqCst);
    }
}

impl Hal for MockHal {
    type Mutex<T: Send> = HostMutex<T>;
    type Condvar = HostCondvar;
    type DmaBuffer = MockDmaBuffer;
    type Bar = MockBar;

    fn dma_alloc(&self, len: usize) -> Result<Self::DmaBuffer, AllocError> {
        self.dma_allocs.fetch_add(1, Ordering::SeqCst);
        Ok(MockDmaBuffer {
            mem: Arc::clone(&self.mem),
            paddr: self.mem.alloc(len),
            len,
        })
    }

    fn uptime_secs(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }
}

// ---------------------------------------------------------------- device

/// What the device answers to one command.
pub enum DeviceReply {
    /// A reply message (may exceed any posted buffer; the device
    /// truncates into the buffer but reports the full length).
    Data { ty: u8, data: Vec<u8> },
    /// Command consumed without producing a reply.
    None,
}

type ReplyFn = Box<dyn Fn(u8, &[u8]) -> DeviceReply + Send>;

/// Which latched command a manual release applies to.
#[derive(Debug, Clone, Copy)]
enum Release {
    Oldest,
    Newest,
}

struct LatchedCmd {
    cookie: u64,
    ty: u8,
    input: Vec<u8>,
}

/// What the device observed about one latched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenCmd {
    pub slot: u32,
    pub cookie: u64,
    pub ty: u8,
    pub input: Vec<u8>,
}

struct PostedReply {
    slot: u32,
    cookie: u64,
    paddr: u64,
    capacity: usize,
}

#[derive(Clone, Copy)]
struct RingAddr {
    base: u64,
    shift: u32,
}

struct DevState {
    version: (u32, u32),
    flags: u32,
    cmd_ring: Option<RingAddr>,
    reply_ring: Option<RingAddr>,
    comp_ring: Option<RingAddr>,
    /// Pre-posted reply descriptors, consumed in posting order.
    posted_replies: VecDeque<PostedReply>,
    /// Latched commands not yet completed.
    latched: VecDeque<LatchedCmd>,
    /// Pending manual releases (hold mode).
    releases: VecDeque<Release>,
    hold: bool,
    reply_fn: ReplyFn,
    /// Guest addresses of the reply buffers consumed, in order.
    consumed_reply_paddrs: Vec<u64>,
    /// Every command latched, in doorbell order.
    seen_cmds: Vec<SeenCmd>,
    /// Command cookies completed, in completion order.
    completed_cmds: Vec<u64>,
    /// Device-side completion ring cursor.
    comp_next: u64,
    shutdown: bool,
}

struct DevCore {
    mem: Arc<GuestMem>,
    state: StdMutex<DevState>,
    work: StdCondvar,
    intr: StdMutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl DevCore {
    fn ring_slot<'a>(state: &'a mut DevState, reg: BarReg) -> &'a mut RingAddr {
        let slot = match reg {
            BarReg::Cbase | BarReg::Cshift => &mut state.cmd_ring,
            BarReg::Rbase | BarReg::Rshift => &mut state.reply_ring,
            BarReg::Cpbase | BarReg::Cpshift => &mut state.comp_ring,
            _ => unreachable!("{reg:?} does not describe a ring"),
        };
        slot.get_or_insert(RingAddr { base: 0, shift: 0 })
    }

    fn set_ring_base(&self, reg: BarReg, value: u64) {
        let mut state = self.state.lock().unwrap();
        Self::ring_slot(&mut state, reg).base = value;
    }

    fn set_ring_shift(&self, reg: BarReg, value: u32) {
        let mut state = self.state.lock().unwrap();
        Self::ring_slot(&mut state, reg).shift = value;
    }

    fn raise_interrupt(&self) {
        let handler = self.intr.lock().unwrap();
        if let Some(handler) = handler.as_ref() {
            handler();
        }
    }

    /// Doorbell write: latch a command or record a posted reply.
    /// Runs inline on the writing thread, in doorbell order.
    fn doorbell(&self, value: u32) {
        let mut state = self.state.lock().unwrap();
        let slot = value & DBELL_INDEX_MASK;

        if value & DBELL_REPLY != 0 {
            let Some(ring) = state.reply_ring else {
                state.flags |= DeviceFlags::SEQ.bits();
                return;
            };
            let paddr = desc_paddr(ring, slot, MSG_DESC_SIZE);
            if owner_at(&self.mem, paddr) != Some(Owner::Device) {
                state.flags |= DeviceFlags::OVF.bits();
                return;
            }
            let desc: MsgDesc = unsafe { read_desc(&self.mem, paddr) };
            state.posted_replies.push_back(PostedReply {
                slot,
                cookie: desc.cookie,
                paddr: desc.ptr[0],
                capacity: desc.len[0] as usize,
            });
        } else {
            let Some(ring) = state.cmd_ring else {
                state.flags |= DeviceFlags::SEQ.bits();
                return;
            };
            let paddr = desc_paddr(ring, slot, MSG_DESC_SIZE);
            if owner_at(&self.mem, paddr) != Some(Owner::Device) {
                state.flags |= DeviceFlags::OVF.bits();
                return;
            }
            let desc: MsgDesc = unsafe { read_desc(&self.mem, paddr) };
            let mut input = Vec::new();
            for segment in 0..4 {
                let len = desc.len[segment] as usize;
                if len > 0 {
                    input.extend(read_bytes(&self.mem, desc.ptr[segment], len));
                }
            }
            // Command latched; the slot goes back to the host now.
            set_owner_at(&self.mem, paddr, Owner::Host);
            state.seen_cmds.push(SeenCmd {
                slot,
                cookie: desc.cookie,
                ty: desc.ty,
                input: input.clone(),
            });
            state.latched.push_back(LatchedCmd {
                cookie: desc.cookie,
                ty: desc.ty,
                input,
            });
        }
        self.work.notify_all();
    }

    /// Takes the next completable command according to the mode.
    fn next_work(&self, state: &mut DevState) -> Option<LatchedCmd> {
        if state.latched.is_empty() {
            return None;
        }
        if !state.hold {
            return state.latched.pop_front();
        }
        match state.releases.pop_front() {
            Some(Release::Oldest) => state.latched.pop_front(),
            Some(Release::Newest) => state.latched.pop_back(),
            None => None,
        }
    }

    /// Produces the reply and completion for one latched command.
    /// Drops the state lock before raising the interrupt.
    fn complete(&self, cmd: &LatchedCmd, state: &mut DevState) {
        let reply = (state.reply_fn)(cmd.ty, &cmd.input);
        let (ty, msglen, reply_cookie) = match reply {
            DeviceReply::None => (0, 0, 0),
            DeviceReply::Data { ty, data } => {
                let Some(posted) = state.posted_replies.pop_front() else {
                    state.flags |= DeviceFlags::DROP.bits();
                    return;
                };
                let fits = data.len().min(posted.capacity);
                write_bytes(&self.mem, posted.paddr, &data[..fits]);
                state.consumed_reply_paddrs.push(posted.paddr);
                // Reply descriptor consumed; its ring slot returns to
                // the host so it can be recycled.
                let Some(ring) = state.reply_ring else {
                    state.flags |= DeviceFlags::SEQ.bits();
                    return;
                };
                set_owner_at(
                    &self.mem,
                    desc_paddr(ring, posted.slot, MSG_DESC_SIZE),
                    Owner::Host,
                );
                (ty, data.len() as u32, posted.cookie)
            }
        };

        let Some(ring) = state.comp_ring else {
            state.flags |= DeviceFlags::SEQ.bits();
            return;
        };
        let entries = 1_u64 << ring.shift;
        let slot = u32::try_from(state.comp_next % entries).unwrap();
        let paddr = desc_paddr(ring, slot, COMP_DESC_SIZE);
        if owner_at(&self.mem, paddr) != Some(Owner::Device) {
            state.flags |= DeviceFlags::OVF.bits();
            return;
        }

        let comp = CompDesc {
            owner: Owner::Host as u8,
            ty,
            reserved0: [0; 2],
            msglen,
            reserved1: 0,
            cmd_cookie: cmd.cookie,
            reply_cookie,
        };
        let bytes = unsafe {
            core::slice::from_raw_parts(
                (&raw const comp).cast::<u8>(),
                COMP_DESC_SIZE,
            )
        };
        unsafe {
            write_desc_body(&self.mem, paddr, bytes);
        }
        set_owner_at(&self.mem, paddr, Owner::Host);
        state.comp_next += 1;
        state.completed_cmds.push(cmd.cookie);
    }

    fn worker(&self) {
        loop {
            let cmd = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if state.shutdown {
                        return;
                    }
                    if let Some(cmd) = self.next_work(&mut state) {
                        self.complete(&cmd, &mut state);
                        break Some(cmd);
                    }
                    state = self.work.wait(state).unwrap();
                }
            };
            if cmd.is_some() {
                self.raise_interrupt();
            }
        }
    }
}

fn desc_paddr(ring: RingAddr, slot: u32, desc_size: usize) -> u64 {
    let entries = 1_u32 << ring.shift;
    assert!(slot < entries, "doorbell slot {slot} out of range");
    ring.base + u64::from(slot) * desc_size as u64
}

// ---------------------------------------------------------------- BAR

pub struct MockBar {
    core: Arc<DevCore>,
}

impl Bar for MockBar {
    fn read_reg(&self, reg: BarReg) -> u32 {
        match reg {
            BarReg::Vmaj => self.core.state.lock().unwrap().version.0,
            BarReg::Vmin => self.core.state.lock().unwrap().version.1,
            BarReg::Flags => self.core.state.lock().unwrap().flags,
            _ => 0,
        }
    }

    fn write_reg(&self, reg: BarReg, value: u32) {
        match reg {
            BarReg::Cshift | BarReg::Rshift | BarReg::Cpshift => {
                self.core.set_ring_shift(reg, value);
            }
            BarReg::Dbell => self.core.doorbell(value),
            BarReg::Cpdbell => {
                // The owner byte is authoritative; the index is only
                // sanity-checked.
                let state = self.core.state.lock().unwrap();
                if let Some(ring) = state.comp_ring {
                    assert!(value < (1 << ring.shift));
                }
            }
            BarReg::Flags => {
                // Only the reset bit is writable; ignore.
            }
            _ => panic!("write to read-only register {reg:?}"),
        }
    }

    fn write_reg64(&self, reg: BarReg, value: u64) {
        self.core.set_ring_base(reg, value);
    }

    fn barrier(&self) {
        fence(Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------- rig

/// The software coprocessor plus its worker thread.
pub struct SoftVkey {
    core: Arc<DevCore>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SoftVkey {
    pub fn new(mem: Arc<GuestMem>) -> Self {
        let core = Arc::new(DevCore {
            mem,
            state: StdMutex::new(DevState {
                version: (1, 0),
                flags: 0,
                cmd_ring: None,
                reply_ring: None,
                comp_ring: None,
                posted_replies: VecDeque::new(),
                latched: VecDeque::new(),
                releases: VecDeque::new(),
                hold: false,
                reply_fn: Box::new(|ty, input| DeviceReply::Data {
                    ty,
                    data: input.to_vec(),
                }),
                consumed_reply_paddrs: Vec::new(),
                seen_cmds: Vec::new(),
                completed_cmds: Vec::new(),
                comp_next: 0,
                shutdown: false,
            }),
            work: StdCondvar::new(),
            intr: StdMutex::new(None),
        });
        let worker = {
            let core = Arc::clone(&core);
            thread::spawn(move || core.worker())
        };
        Self {
            core,
            worker: Some(worker),
        }
    }

    pub fn bar(&self) -> MockBar {
        MockBar {
            core: Arc::clone(&self.core),
        }
    }

    pub fn set_interrupt_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.core.intr.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn set_reply_fn(&self, reply_fn: impl Fn(u8, &[u8]) -> DeviceReply + Send + 'static) {
        self.core.state.lock().unwrap().reply_fn = Box::new(reply_fn);
    }

    /// Stop auto-completing; commands complete only on `release_*`.
    pub fn hold_completions(&self) {
        self.core.state.lock().unwrap().hold = true;
    }

    pub fn release_oldest(&self) {
        self.release(Release::Oldest);
    }

    pub fn release_newest(&self) {
        self.release(Release::Newest);
    }

    fn release(&self, which: Release) {
        self.core.state.lock().unwrap().releases.push_back(which);
        self.core.work.notify_all();
    }

    /// Latched commands awaiting completion.
    pub fn pending(&self) -> usize {
        self.core.state.lock().unwrap().latched.len()
    }

    /// Spins until `pending()` reaches `n` (with a timeout).
    pub fn wait_pending(&self, n: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.pending() < n {
            assert!(Instant::now() < deadline, "device never saw {n} commands");
            thread::sleep(Duration::from_micros(200));
        }
    }

    /// Sets error flags and raises the interrupt so the driver notices.
    pub fn inject_fault(&self, flags: DeviceFlags) {
        self.core.state.lock().unwrap().flags |= flags.bits();
        self.core.raise_interrupt();
    }

    pub fn consumed_reply_paddrs(&self) -> Vec<u64> {
        self.core.state.lock().unwrap().consumed_reply_paddrs.clone()
    }

    /// Every command the device has latched, in doorbell order.
    pub fn seen_commands(&self) -> Vec<SeenCmd> {
        self.core.state.lock().unwrap().seen_cmds.clone()
    }

    /// Command cookies completed so far, in completion order.
    pub fn completed_commands(&self) -> Vec<u64> {
        self.core.state.lock().unwrap().completed_cmds.clone()
    }

    /// Overrides the version registers (before attach).
    pub fn set_version(&self, vmaj: u32, vmin: u32) {
        self.core.state.lock().unwrap().version = (vmaj, vmin);
    }

    /// Sets error flags without raising the interrupt.
    pub fn set_flags(&self, flags: DeviceFlags) {
        self.core.state.lock().unwrap().flags |= flags.bits();
    }
}

impl Drop for SoftVkey {
    fn drop(&mut self) {
        self.core.state.lock().unwrap().shutdown = true;
        self.core.work.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

pub struct Rig {
    pub hal: MockHal,
    pub dev: SoftVkey,
    pub vkey: Arc<Vkey<MockHal>>,
}

/// Builds a full driver-plus-device rig with echo behavior.
pub fn rig(config: RingConfig) -> Rig {
    let mem = Arc::new(GuestMem::new());
    let hal = MockHal::new(Arc::clone(&mem));
    let dev = SoftVkey::new(mem);
    let vkey = Vkey::attach(hal.clone(), dev.bar(), config).expect("attach");
    let intr_target = Arc::clone(&vkey);
    dev.set_interrupt_handler(move || intr_target.handle_interrupt());
    Rig { hal, dev, vkey }
}

/// Convenience wrapper: submit one echo command and return the reply
/// bytes actually copied out.
pub fn submit_echo(
    vkey: &Vkey<MockHal>,
    payload: &[u8],
    out_len: usize,
) -> Result<(vkey_driver::proto::SubmitReply, Vec<u8>), vkey_driver::VkeyError> {
    let args = vkey_driver::proto::SubmitArgs {
        flags: vkey_driver::proto::SubmitFlags::empty(),
        cmd_type: 0x0B,
        input: &[payload],
    };
    let mut out = vec![0_u8; out_len];
    let reply = vkey.submit(&args, &mut [&mut out], vkey_driver::proto::DEFAULT_REPLY_SIZE)?;
    out.truncate(reply.rlen.min(out_len));
    Ok((reply, out))
}
