//! Reply-buffer pool accounting.
//!
//! `n_cmd` counts commands between submit and epilogue; `n_free`
//! counts posted reply descriptors not yet earmarked for a command.
//! The invariants enforced here are the load-bearing contracts of the
//! whole driver:
//!
//! * `0 <= n_cmd <= cmd ring entries`
//! * `n_cmd + n_free <= reply ring entries`

pub(crate) struct ReplyPool {
    n_cmd: u32,
    n_free: u32,
    cmd_capacity: u32,
    reply_capacity: u32,
}

impl ReplyPool {
    pub(crate) fn new(cmd_capacity: u32, reply_capacity: u32) -> Self {
        Self {
            n_cmd: 0,
            n_free: 0,
            cmd_capacity,
            reply_capacity,
        }
    }

    pub(crate) fn n_cmd(&self) -> u32 {
        self.n_cmd
    }

    pub(crate) fn n_free(&self) -> u32 {
        self.n_free
    }

    /// True while no further command may enter the ring.
    pub(crate) fn cmd_ring_full(&self) -> bool {
        self.n_cmd == self.cmd_capacity
    }

    /// True when one more reply descriptor may be posted.
    pub(crate) fn can_post_reply(&self) -> bool {
        self.n_cmd + self.n_free < self.reply_capacity
    }

    /// A reply descriptor was posted to the device.
    pub(crate) fn reply_posted(&mut self) {
        self.n_free += 1;
        assert!(
            self.n_cmd + self.n_free <= self.reply_capacity,
            "reply ring over-posted"
        );
    }

    /// A command claimed its ring slot and one posted reply.
    pub(crate) fn claim(&mut self) {
        assert!(self.n_free > 0, "claim without a posted reply");
        self.n_free -= 1;
        self.n_cmd += 1;
        assert!(self.n_cmd <= self.cmd_capacity, "command ring over-claimed");
    }

    /// A command left the in-flight set without the device consuming
    /// the reply it claimed; the posted descriptor returns to the idle
    /// pool as-is.
    pub(crate) fn unclaim(&mut self) {
        assert!(self.n_cmd > 0, "unclaim with no command in flight");
        self.n_cmd -= 1;
        self.n_free += 1;
    }

    /// A command left the in-flight set through the submit epilogue.
    pub(crate) fn retire(&mut self) {
        assert!(self.n_cmd > 0, "retire with no command in flight");
        self.n_cmd -= 1;
    }

    /// An abandoned command's completion surfaced in the interrupt
    /// handler. Device-driven, so tolerate (and report) a count that
    /// no longer adds up rather than tearing the kernel down.
    pub(crate) fn retire_orphan(&mut self) {
        if self.n_cmd == 0 {
            log::error!("vkey: orphan completion with no command in flight");
            return;
        }
        self.n_cmd -= 1;
    }
}
