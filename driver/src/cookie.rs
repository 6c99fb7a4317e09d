//! Cookie bookkeeping.
//!
//! Every posted command and every pre-posted reply buffer is tagged
//! with a 64-bit cookie the device echoes back in completions. The
//! table owns the per-request records; ring descriptors carry only the
//! cookie values, so there are no cycles to manage.

use alloc::{collections::BTreeMap, sync::Arc};

use sync_api::Condvar;

use vkey_proto::REPLY_COOKIE_BASE;

use crate::{error::VkeyError, hal::Hal};

/// Monotonic cookie sources, one per kind.
///
/// Both start at the same base; reply cookies are displaced into their
/// own range so the two kinds can never collide.
pub(crate) struct CookieGen {
    next_cmd: u64,
    next_reply: u64,
}

impl CookieGen {
    pub(crate) fn new(start: u64) -> Self {
        Self {
            next_cmd: start,
            next_reply: start,
        }
    }

    pub(crate) fn next_cmd(&mut self) -> Result<u64, VkeyError> {
        if self.next_cmd >= REPLY_COOKIE_BASE {
            return Err(VkeyError::CookieOverflow);
        }
        let cookie = self.next_cmd;
        self.next_cmd += 1;
        Ok(cookie)
    }

    pub(crate) fn next_reply(&mut self) -> u64 {
        let cookie = REPLY_COOKIE_BASE + self.next_reply;
        self.next_reply += 1;
        cookie
    }
}

/// What the completion interrupt recorded for a finished command.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReplyInfo {
    /// Cookie of the reply descriptor the device filled, zero for a
    /// reply-less completion.
    pub(crate) cookie: u64,
    /// Full reply length as reported by the device.
    pub(crate) len: u32,
    /// Reply type byte.
    pub(crate) ty: u8,
}

/// State of one in-flight command.
pub(crate) struct CmdRecord<H: Hal> {
    pub(crate) slot: u32,
    pub(crate) created: u64,
    /// Set by the completion handler.
    pub(crate) done: bool,
    /// Set when the instance detaches with this command in flight.
    pub(crate) failed: bool,
    /// Set when the submitting thread was interrupted and gave up on
    /// the command. The record (and the input buffer it owns) stays
    /// until the device produces the completion.
    pub(crate) abandoned: bool,
    /// The loaded input segments. Held here so the memory outlives the
    /// device's reads even if the submitter is interrupted.
    pub(crate) input: Option<H::DmaBuffer>,
    pub(crate) reply: Option<ReplyInfo>,
    /// Signalled once `done` (or `failed`) is set.
    pub(crate) done_cv: Arc<H::Condvar>,
}

impl<H: Hal> CmdRecord<H> {
    pub(crate) fn new(slot: u32, created: u64, input: Option<H::DmaBuffer>) -> Self {
        Self {
            slot,
            created,
            done: false,
            failed: false,
            abandoned: false,
            input,
            reply: None,
            done_cv: Arc::new(<H::Condvar as Condvar>::new()),
        }
    }
}

/// State of one posted reply descriptor: the backing DMA buffer and
/// where it sits in the reply ring.
pub(crate) struct ReplyRecord<B> {
    pub(crate) slot: u32,
    pub(crate) created: u64,
    pub(crate) buf: B,
}

/// The driver-local side of the cookie protocol: two ordered maps,
/// commands and replies, keyed by cookie value. All access is under
/// the instance mutex.
pub(crate) struct CookieTable<H: Hal> {
    cmds: BTreeMap<u64, CmdRecord<H>>,
    replies: BTreeMap<u64, ReplyRecord<H::DmaBuffer>>,
}

impl<H: Hal> CookieTable<H> {
    pub(crate) fn new() -> Self {
        Self {
            cmds: BTreeMap::new(),
            replies: BTreeMap::new(),
        }
    }

    pub(crate) fn insert_cmd(&mut self, cookie: u64, record: CmdRecord<H>) {
        let previous = self.cmds.insert(cookie, record);
        debug_assert!(previous.is_none(), "duplicate command cookie {cookie}");
    }

    pub(crate) fn cmd(&self, cookie: u64) -> Option<&CmdRecord<H>> {
        self.cmds.get(&cookie)
    }

    pub(crate) fn cmd_mut(&mut self, cookie: u64) -> Option<&mut CmdRecord<H>> {
        self.cmds.get_mut(&cookie)
    }

    pub(crate) fn remove_cmd(&mut self, cookie: u64) -> Option<CmdRecord<H>> {
        self.cmds.remove(&cookie)
    }

    pub(crate) fn insert_reply(&mut self, cookie: u64, record: ReplyRecord<H::DmaBuffer>) {
        let previous = self.replies.insert(cookie, record);
        debug_assert!(previous.is_none(), "duplicate reply cookie {cookie}");
    }

    pub(crate) fn reply(&self, cookie: u64) -> Option<&ReplyRecord<H::DmaBuffer>> {
        self.replies.get(&cookie)
    }

    pub(crate) fn remove_reply(&mut self, cookie: u64) -> Option<ReplyRecord<H::DmaBuffer>> {
        self.replies.remove(&cookie)
    }

    /// Marks every in-flight command failed and wakes its waiter.
    /// Called when the instance detaches.
    pub(crate) fn fail_all_cmds(&mut self, now: u64) {
        for (cookie, record) in &mut self.cmds {
            log::warn!(
                "vkey: failing in-flight command {cookie} (slot {slot}, age {age}s)",
                slot = record.slot,
                age = now.saturating_sub(record.created),
            );
            record.failed = true;
            record.done_cv.notify_all();
        }
    }
}
