//! Staged work-request batching.
//!
//! Each queue pair keeps staging lists for send-side and receive-side work
//! requests. Queueing appends; flushing posts the whole chain in order,
//! amortizing doorbell updates. When a post fails part-way, the staged
//! list rewinds to the failing request and the failure surfaces the guilty
//! work-request cookie so the owner can fail the request that produced it.

use std::collections::VecDeque;

use tracing::warn;

use crate::rdma::verbs::{Qp, RecvWr, SendWr, Srq};

/// Outcome of a failed flush.
#[derive(Debug)]
pub struct FlushFailure {
    /// How many work requests were posted before the failure
    pub posted: usize,
    /// Cookie of the first work request that failed to post
    pub bad_wr_id: u64,
    /// How many staged work requests did not post (the bad one included)
    pub unposted: usize,
}

/// Per-queue-pair staging of send work requests.
#[derive(Debug, Default)]
pub struct SendBatcher {
    staged: VecDeque<SendWr>,
    /// Total work requests submitted through this batcher
    pub num_submitted: u64,
    /// Number of flushes that reached the device
    pub doorbell_updates: u64,
}

impl SendBatcher {
    /// Create an empty batcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chain of work requests to the staging list.
    ///
    /// Returns true when the list was empty, i.e. the queue pair needs to
    /// be scheduled for a flush.
    pub fn queue(&mut self, wrs: Vec<SendWr>) -> bool {
        let was_empty = self.staged.is_empty();
        self.num_submitted += wrs.len() as u64;
        self.staged.extend(wrs);
        was_empty
    }

    /// Number of staged, not yet posted work requests.
    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    /// Iterate the staged work requests in posting order.
    pub fn staged(&self) -> impl Iterator<Item = &SendWr> {
        self.staged.iter()
    }

    /// Post the staged chain.
    ///
    /// On success returns how many work requests were posted. On partial
    /// failure the staged head rewinds to the failing request and the
    /// failure carries its cookie plus the count of un-posted requests, so
    /// the caller can wind `current_send_depth` back down.
    pub fn flush(&mut self, qp: &Qp) -> std::result::Result<usize, FlushFailure> {
        if self.staged.is_empty() {
            return Ok(0);
        }
        let wrs: Vec<SendWr> = self.staged.drain(..).collect();
        let total = wrs.len();
        self.doorbell_updates += 1;

        match qp.post_send(wrs.clone()) {
            Ok(()) => Ok(total),
            Err(bad_idx) => {
                let bad_wr_id = wrs[bad_idx].wr_id;
                warn!(
                    bad_idx,
                    bad_wr_id, "send flush failed part-way, rewinding staged list"
                );
                // Rewind: everything from the failing request stays staged.
                for wr in wrs.into_iter().skip(bad_idx) {
                    self.staged.push_back(wr);
                }
                Err(FlushFailure {
                    posted: bad_idx,
                    bad_wr_id,
                    unposted: total - bad_idx,
                })
            }
        }
    }

    /// Drop everything still staged (queue pair teardown).
    pub fn clear(&mut self) -> usize {
        let n = self.staged.len();
        self.staged.clear();
        n
    }
}

/// Per-queue-pair staging of receive work requests.
#[derive(Debug, Default)]
pub struct RecvBatcher {
    staged: VecDeque<RecvWr>,
    /// Total work requests submitted through this batcher
    pub num_submitted: u64,
    /// Number of flushes that reached the device
    pub doorbell_updates: u64,
}

impl RecvBatcher {
    /// Create an empty batcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append receive work requests to the staging list. Returns true when
    /// the list was previously empty.
    pub fn queue(&mut self, wrs: Vec<RecvWr>) -> bool {
        let was_empty = self.staged.is_empty();
        self.num_submitted += wrs.len() as u64;
        self.staged.extend(wrs);
        was_empty
    }

    /// Number of staged, not yet posted work requests.
    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    /// Post the staged receives onto the queue pair's own ring.
    pub fn flush(&mut self, qp: &Qp) -> std::result::Result<usize, FlushFailure> {
        if self.staged.is_empty() {
            return Ok(0);
        }
        let wrs: Vec<RecvWr> = self.staged.drain(..).collect();
        let total = wrs.len();
        self.doorbell_updates += 1;

        match qp.post_recv(wrs.clone()) {
            Ok(()) => Ok(total),
            Err(bad_idx) => {
                let bad_wr_id = wrs[bad_idx].wr_id;
                for wr in wrs.into_iter().skip(bad_idx) {
                    self.staged.push_back(wr);
                }
                Err(FlushFailure {
                    posted: bad_idx,
                    bad_wr_id,
                    unposted: total - bad_idx,
                })
            }
        }
    }

    /// Post the staged receives onto a shared receive queue.
    pub fn flush_srq(&mut self, srq: &Srq) -> std::result::Result<usize, FlushFailure> {
        if self.staged.is_empty() {
            return Ok(0);
        }
        let wrs: Vec<RecvWr> = self.staged.drain(..).collect();
        let total = wrs.len();
        self.doorbell_updates += 1;

        match srq.post_recv(wrs.clone()) {
            Ok(()) => Ok(total),
            Err(bad_idx) => {
                let bad_wr_id = wrs[bad_idx].wr_id;
                for wr in wrs.into_iter().skip(bad_idx) {
                    self.staged.push_back(wr);
                }
                Err(FlushFailure {
                    posted: bad_idx,
                    bad_wr_id,
                    unposted: total - bad_idx,
                })
            }
        }
    }

    /// Drop everything still staged.
    pub fn clear(&mut self) -> usize {
        let n = self.staged.len();
        self.staged.clear();
        n
    }
}
