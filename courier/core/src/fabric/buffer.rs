//! Multi-Use Receive Buffer Accounting
//!
//! Shared by both providers: one registered region services many inbound
//! messages, placed back to back, until remaining space drops below the
//! configured threshold. The region is then released and must be reposted
//! before further messages land; messages arriving in between are queued
//! by the provider and drained on repost, so no message is lost across an
//! exhaustion.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ReceiveRegion, ResourceToken};

/// Outcome of depositing one inbound message into the region.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Deposit {
    /// Message placed in the region. `exhausted` marks that this deposit
    /// released the region (remaining space fell below the threshold).
    Delivered {
        /// Offset of the message within the region.
        offset: usize,
        /// Message length in bytes.
        len: usize,
        /// Whether the region was released by this deposit.
        exhausted: bool,
    },
    /// The message did not fit the remaining space: the region was
    /// released with no payload and the message queued for the repost.
    ExhaustionOnly,
    /// No region is currently posted; the message was queued.
    Queued,
    /// The message exceeds the whole region and was discarded.
    Dropped,
}

/// Region state: buffer, write cursor, posted flag, exhaustion threshold,
/// and the queue of messages awaiting a repost.
#[derive(Debug)]
pub(crate) struct MultiRecvBuffer {
    buf: Vec<u8>,
    write_pos: usize,
    posted: bool,
    min_multi_recv: usize,
    pending: VecDeque<Vec<u8>>,
}

impl MultiRecvBuffer {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            buf: vec![0; len],
            write_pos: 0,
            posted: false,
            min_multi_recv: 0,
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn set_min_multi_recv(&mut self, bytes: usize) {
        self.min_multi_recv = bytes;
    }

    /// Place one inbound message.
    pub(crate) fn deposit(&mut self, bytes: Vec<u8>) -> Deposit {
        if bytes.len() > self.buf.len() {
            return Deposit::Dropped;
        }
        if !self.posted {
            self.pending.push_back(bytes);
            return Deposit::Queued;
        }
        let remaining = self.buf.len() - self.write_pos;
        if bytes.len() > remaining {
            // Release the region; the message stays first in line.
            self.posted = false;
            self.pending.push_front(bytes);
            return Deposit::ExhaustionOnly;
        }
        let offset = self.write_pos;
        self.buf[offset..offset + bytes.len()].copy_from_slice(&bytes);
        self.write_pos += bytes.len();
        let exhausted = self.buf.len() - self.write_pos < self.min_multi_recv;
        if exhausted {
            self.posted = false;
        }
        Deposit::Delivered {
            offset,
            len: bytes.len(),
            exhausted,
        }
    }

    /// Post (or repost) the region: reset the cursor and drain queued
    /// messages until the queue is empty or the region exhausts again.
    pub(crate) fn post(&mut self) -> Vec<Deposit> {
        self.posted = true;
        self.write_pos = 0;
        let mut drained = Vec::new();
        while self.posted {
            let Some(bytes) = self.pending.pop_front() else {
                break;
            };
            drained.push(self.deposit(bytes));
        }
        drained
    }

    pub(crate) fn copy_out(&self, offset: usize, len: usize) -> Vec<u8> {
        self.buf[offset..offset + len].to_vec()
    }
}

/// [`ReceiveRegion`] handle over shared region state; both providers
/// return this from `register_receive_region`.
pub(crate) struct RegionHandle {
    token: ResourceToken,
    state: Arc<Mutex<MultiRecvBuffer>>,
}

impl RegionHandle {
    pub(crate) fn new(token: ResourceToken, state: Arc<Mutex<MultiRecvBuffer>>) -> Self {
        Self { token, state }
    }
}

impl ReceiveRegion for RegionHandle {
    fn token(&self) -> ResourceToken {
        self.token
    }

    fn len(&self) -> usize {
        self.state.lock().len()
    }

    fn copy_out(&self, offset: usize, len: usize) -> Vec<u8> {
        self.state.lock().copy_out(offset, len)
    }
}
