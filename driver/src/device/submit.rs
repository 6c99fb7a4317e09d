//! The submit path: one command from ioctl entry to epilogue.

use alloc::sync::Arc;

use arrayvec::ArrayVec;
use sync_api::{Condvar, Mutex as _, WaitError};
use vkey_proto::{
    DEFAULT_REPLY_SIZE, MsgDesc, NIOV, Owner, SubmitArgs, SubmitFlags, SubmitReply,
};

use crate::{
    cookie::{CmdRecord, ReplyRecord},
    device::{State, Vkey},
    error::VkeyError,
    hal::{DmaBuffer, Hal},
};

/// Input segments loaded into a DMA buffer, descriptor-ready.
struct InputMap<B> {
    buf: Option<B>,
    segs: ArrayVec<(u64, u32), NIOV>,
}

impl<H: Hal> Vkey<H> {
    /// Submits one command and blocks until its completion.
    ///
    /// `reply_size` is the buffer capacity to post if the pool needs a
    /// new reply descriptor; callers pass [`DEFAULT_REPLY_SIZE`] and
    /// retry with the value carried by
    /// [`VkeyError::BufferTooSmall`] when bouncing (see
    /// [`crate::FileHandle::submit`], which wraps the retry loop).
    ///
    /// On success the reply bytes have been copied into `out` (in
    /// order, truncated to what fits) and the returned
    /// [`SubmitReply`] carries the device-reported type and length.
    pub fn submit(
        &self,
        args: &SubmitArgs<'_>,
        out: &mut [&mut [u8]],
        reply_size: usize,
    ) -> Result<SubmitReply, VkeyError> {
        if args.input.len() > NIOV || out.len() > NIOV {
            return Err(VkeyError::TooManySegments);
        }

        // Load the input before taking the lock.
        let input = self.map_input(args.input)?;

        let mut guard = self.state.lock();
        if guard.detached {
            return Err(VkeyError::NoDevice);
        }
        let cookie = guard.cookie_gen.next_cmd()?;

        // A command slot and a posted reply, verified in a single
        // unbroken locked epoch: any unlock (slot wait, buffer
        // allocation) restarts the checks.
        loop {
            while guard.pool.cmd_ring_full() {
                guard = self
                    .cmd_available
                    .wait_interruptible(&self.state, guard)?;
                if guard.detached {
                    return Err(VkeyError::Io);
                }
            }
            if guard.pool.n_free() > 0 {
                break;
            }
            match guard.pending_reply.take() {
                Some(buf) if buf.len() >= reply_size => {
                    self.post_reply_locked(&mut guard, buf)?;
                    break;
                }
                stale => {
                    // No pending buffer (or one too small from an
                    // earlier attempt): allocate with the lock
                    // released, stash, re-verify.
                    drop(stale);
                    drop(guard);
                    let buf = self.hal.dma_alloc(reply_size)?;
                    guard = self.state.lock();
                    if guard.detached {
                        return Err(VkeyError::NoDevice);
                    }
                    guard.pending_reply = Some(buf);
                }
            }
        }

        // Claim the slot and hand the descriptor over.
        let slot = guard.cmd_ring.head_slot();
        match guard.cmd_ring.owner(slot) {
            Some(Owner::Host) => {}
            _ => return Err(self.protocol_violation(&mut guard, "command slot not host-owned")),
        }

        let mut desc = MsgDesc {
            owner: Owner::Device as u8,
            ty: args.cmd_type,
            reserved: [0; 6],
            len: [0; 4],
            cookie,
            ptr: [0; 4],
        };
        for (index, (addr, len)) in input.segs.iter().enumerate() {
            desc.ptr[index] = *addr;
            desc.len[index] = *len;
        }

        let record = CmdRecord::new(slot, self.hal.uptime_secs(), input.buf);
        let done_cv = Arc::clone(&record.done_cv);
        guard.cookies.insert_cmd(cookie, record);
        guard.pool.claim();
        guard.cmd_ring.write_desc(slot, &desc);
        guard.cmd_ring.advance();
        self.regs.cmd_doorbell(slot);

        let flags = self.regs.flags();
        if flags.is_faulted() {
            // The device died under the doorbell; nothing will ever
            // complete this command.
            drop(guard.cookies.remove_cmd(cookie));
            guard.pool.unclaim();
            return Err(self.device_fault(&mut guard, flags));
        }

        // Sleep until the completion handler marks the command done.
        loop {
            let Some(record) = guard.cookies.cmd(cookie) else {
                return Err(self.protocol_violation(&mut guard, "command cookie vanished"));
            };
            if record.failed || guard.detached {
                drop(guard.cookies.remove_cmd(cookie));
                guard.pool.unclaim();
                return Err(VkeyError::Io);
            }
            if record.done {
                break;
            }
            match done_cv.wait_interruptible(&self.state, guard) {
                Ok(reacquired) => guard = reacquired,
                Err(WaitError::Interrupted) => return self.abandon(cookie),
            }
        }

        let reply = guard.cookies.cmd(cookie).and_then(|record| record.reply);
        let mut result = SubmitReply::default();

        let Some(info) = reply else {
            // Reply-less completion.
            drop(guard);
            self.finish_command(cookie, None, false);
            return Ok(result);
        };

        result.reply_type = info.ty;
        result.rlen = info.len as usize;

        // Pin down the reply buffer, then copy out without the lock.
        let (src, capacity) = match guard.cookies.reply(info.cookie) {
            Some(record) => {
                record.buf.sync_for_cpu(0, record.buf.len());
                (record.buf.as_ptr(), record.buf.len())
            }
            None => {
                return Err(
                    self.protocol_violation(&mut guard, "completion names unknown reply cookie")
                );
            }
        };
        drop(guard);

        let rlen = info.len as usize;
        if rlen > capacity && !args.flags.contains(SubmitFlags::TRUNC_OK) {
            // Bounce: report the size the retry must post.
            self.finish_command(cookie, Some(info.cookie), true);
            return Err(VkeyError::BufferTooSmall { required: rlen });
        }

        copy_out(src, rlen.min(capacity), out);
        self.finish_command(cookie, Some(info.cookie), false);
        Ok(result)
    }

    fn map_input(&self, input: &[&[u8]]) -> Result<InputMap<H::DmaBuffer>, VkeyError> {
        let total: usize = input.iter().map(|iov| iov.len()).sum();
        let mut segs = ArrayVec::new();
        if total == 0 {
            return Ok(InputMap { buf: None, segs });
        }

        let buf = self.hal.dma_alloc(total)?;
        let mut offset = 0;
        for iov in input {
            if iov.is_empty() {
                continue;
            }
            let dst = unsafe { buf.as_ptr().add(offset) };
            for (index, byte) in iov.iter().enumerate() {
                unsafe {
                    dst.add(index).write_volatile(*byte);
                }
            }
            segs.push((buf.dma_addr() + offset as u64, iov.len() as u32));
            offset += iov.len();
        }
        buf.sync_for_device(0, total);
        Ok(InputMap {
            buf: Some(buf),
            segs,
        })
    }

    /// Writes a fresh reply descriptor backed by `buf` at the reply
    /// ring head and rings the pre-post doorbell.
    pub(crate) fn post_reply_locked(
        &self,
        state: &mut State<H>,
        buf: H::DmaBuffer,
    ) -> Result<(), VkeyError> {
        if !state.pool.can_post_reply() {
            return Err(self.protocol_violation(state, "reply ring over-posted"));
        }
        let slot = state.reply_ring.head_slot();
        match state.reply_ring.owner(slot) {
            Some(Owner::Host) => {}
            _ => return Err(self.protocol_violation(state, "reply slot not host-owned")),
        }

        let cookie = state.cookie_gen.next_reply();
        let desc = MsgDesc {
            owner: Owner::Device as u8,
            ty: 0,
            reserved: [0; 6],
            len: [buf.len() as u32, 0, 0, 0],
            cookie,
            ptr: [buf.dma_addr(), 0, 0, 0],
        };
        let record = ReplyRecord {
            slot,
            created: self.hal.uptime_secs(),
            buf,
        };
        state.cookies.insert_reply(cookie, record);
        state.reply_ring.write_desc(slot, &desc);
        state.reply_ring.advance();
        state.pool.reply_posted();
        self.regs.reply_doorbell(slot);
        Ok(())
    }

    /// The submit epilogue: retires the command, disposes of the reply
    /// descriptor it consumed, and wakes slot waiters.
    ///
    /// Disposal policy: a default-sized buffer is recycled (reposted
    /// with a fresh cookie); a transient oversize buffer is destroyed
    /// and a default-sized replacement posted in its stead; when the
    /// caller rejected a truncation (`rejected`), the buffer is
    /// destroyed outright and the pool shrinks, so the bounce retry
    /// posts at the larger size.
    fn finish_command(&self, cookie: u64, reply_cookie: Option<u64>, rejected: bool) {
        let mut replacement: Option<H::DmaBuffer> = None;
        if let Some(rc) = reply_cookie {
            let needs_replacement = {
                let guard = self.state.lock();
                !guard.detached
                    && !rejected
                    && guard
                        .cookies
                        .reply(rc)
                        .is_some_and(|record| record.buf.len() > DEFAULT_REPLY_SIZE)
            };
            if needs_replacement {
                match self.hal.dma_alloc(DEFAULT_REPLY_SIZE) {
                    Ok(buf) => replacement = Some(buf),
                    Err(error) => {
                        log::warn!("vkey: cannot replace transient reply buffer: {error}");
                    }
                }
            }
        }

        let mut guard = self.state.lock();
        match reply_cookie {
            None => guard.pool.unclaim(),
            Some(rc) => {
                guard.pool.retire();
                match guard.cookies.remove_reply(rc) {
                    Some(record) => {
                        let recycle = !guard.detached
                            && !rejected
                            && record.buf.len() <= DEFAULT_REPLY_SIZE;
                        if recycle {
                            // Violations inside are logged and detach.
                            let _ = self.post_reply_locked(&mut guard, record.buf);
                        } else {
                            drop(record.buf);
                            if let Some(buf) = replacement.take() {
                                if !guard.detached {
                                    let _ = self.post_reply_locked(&mut guard, buf);
                                }
                            }
                        }
                    }
                    None => log::error!("vkey: reply cookie {rc} missing at epilogue"),
                }
            }
        }
        drop(guard.cookies.remove_cmd(cookie));
        self.cmd_available.notify_all();
    }

    /// The submitter was interrupted. If the completion raced in, run
    /// the normal epilogue; otherwise mark the command abandoned and
    /// leave everything (counters included) for the orphan path in the
    /// completion handler.
    fn abandon(&self, cookie: u64) -> Result<SubmitReply, VkeyError> {
        let mut guard = self.state.lock();
        match guard.cookies.cmd_mut(cookie) {
            Some(record) if record.done => {
                let reply_cookie = record.reply.map(|info| info.cookie);
                drop(guard);
                self.finish_command(cookie, reply_cookie, false);
            }
            Some(record) => {
                record.abandoned = true;
                log::debug!("vkey: command cookie {cookie} abandoned by signal");
            }
            None => {}
        }
        Err(VkeyError::Interrupted)
    }
}

/// Copies `available` reply bytes into the caller's output segments,
/// in order, stopping at whichever runs out first.
fn copy_out(src: *const u8, available: usize, out: &mut [&mut [u8]]) {
    let mut copied = 0;
    for iov in out.iter_mut() {
        for byte in iov.iter_mut() {
            if copied == available {
                return;
            }
            *byte = unsafe { src.add(copied).read_volatile() };
            copied += 1;
        }
    }
}
