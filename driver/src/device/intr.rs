//! Completion-ring consumption, driven by the MSI-X vector.

use sync_api::{Condvar as _, Mutex as _};
use vkey_proto::{CompDesc, DEFAULT_REPLY_SIZE, Owner};

use crate::{
    cookie::ReplyInfo,
    device::{State, Vkey},
    hal::{DmaBuffer as _, Hal},
};

impl<H: Hal> Vkey<H> {
    /// The interrupt handler: consumes every completion the device has
    /// handed back, resolves cookies, wakes waiters, and returns each
    /// slot to the device.
    ///
    /// Runs under the instance mutex and never sleeps. The embedder
    /// wires this to MSI-X vector 0.
    pub fn handle_interrupt(&self) {
        let flags = self.regs.flags();
        let mut guard = self.state.lock();
        if guard.detached {
            return;
        }
        if flags.is_faulted() {
            let _ = self.device_fault(&mut guard, flags);
            return;
        }

        loop {
            let slot = guard.comp_ring.head_slot();
            match guard.comp_ring.owner(slot) {
                Some(Owner::Host) => {}
                _ => break,
            }
            let comp: CompDesc = guard.comp_ring.read_desc(slot);
            guard.comp_ring.advance();

            self.dispatch_completion(&mut guard, &comp);

            // The slot's contents are consumed; give it back before
            // anything that could depend on the device reusing it.
            guard.comp_ring.set_owner(slot, Owner::Device);
            self.regs.comp_doorbell(slot);

            if guard.detached {
                return;
            }
        }

        // The completion doorbells above were BAR interactions too.
        let flags = self.regs.flags();
        if flags.is_faulted() {
            let _ = self.device_fault(&mut guard, flags);
        }
    }

    fn dispatch_completion(&self, state: &mut State<H>, comp: &CompDesc) {
        let no_reply = comp.reply_cookie == 0 && comp.msglen == 0;

        if let Some(record) = state.cookies.cmd_mut(comp.cmd_cookie) {
            if !record.abandoned {
                if !no_reply {
                    record.reply = Some(ReplyInfo {
                        cookie: comp.reply_cookie,
                        len: comp.msglen,
                        ty: comp.ty,
                    });
                }
                record.done = true;
                record.done_cv.notify_all();
                return;
            }
            // Abandoned by a signal: the submitter is gone, so retire
            // the command here and free what it owned (input buffer
            // included, by dropping the record).
            drop(state.cookies.remove_cmd(comp.cmd_cookie));
            if no_reply {
                state.pool.retire_orphan();
                state.pool.reply_posted();
            } else {
                self.reclaim_orphan_reply(state, comp.reply_cookie);
            }
            self.cmd_available.notify_all();
            return;
        }

        log::warn!(
            "vkey: completion for unknown command cookie {cookie}",
            cookie = comp.cmd_cookie
        );
        if !no_reply {
            // Do not let the consumed reply descriptor leak, but the
            // counters never covered this command; leave them alone.
            if let Some(record) = state.cookies.remove_reply(comp.reply_cookie) {
                drop(record.buf);
            }
        }
    }

    /// An abandoned command's completion consumed a posted reply:
    /// recycle it back into the pool (or destroy a transient oversize
    /// buffer) and fix up the counters.
    fn reclaim_orphan_reply(&self, state: &mut State<H>, reply_cookie: u64) {
        state.pool.retire_orphan();
        match state.cookies.remove_reply(reply_cookie) {
            Some(record) => {
                log::debug!(
                    "vkey: recycling orphaned reply cookie {reply_cookie} (slot {slot}, age {age}s)",
                    slot = record.slot,
                    age = self.hal.uptime_secs().saturating_sub(record.created),
                );
                if record.buf.len() <= DEFAULT_REPLY_SIZE && !state.detached {
                    let _ = self.post_reply_locked(state, record.buf);
                } else {
                    // The next submitter re-primes the pool.
                    drop(record.buf);
                }
            }
            None => {
                log::error!("vkey: orphan completion names unknown reply cookie {reply_cookie}");
            }
        }
    }
}
