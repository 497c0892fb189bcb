// Build queue: pending requests ordered by priority (descending) then
// submission time (FIFO within a priority band).

use overseer_common::model::{BuildRequest, RequestState};
use std::collections::BTreeSet;

/// One queued request plus the sequence number that makes ordering total.
struct QueuedRequest {
    seq: u64,
    request: BuildRequest,
}

/// Pending build requests.
///
/// Not internally synchronized: the dispatcher owns the queue behind its
/// dispatch lock so that queue removal and capacity reservation form one
/// atomic decision.
pub struct BuildQueue {
    items: Vec<QueuedRequest>,
    next_seq: u64,
}

impl BuildQueue {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            next_seq: 0,
        }
    }

    /// Add a request to the queue.
    ///
    /// Re-queued requests keep their original submission time, so they
    /// return to their original FIFO position within their priority band.
    pub fn enqueue(&mut self, mut request: BuildRequest) {
        request.state = RequestState::Queued;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push(QueuedRequest { seq, request });
        // Highest priority first; FIFO (submission time, then arrival
        // sequence) within a priority band. Stable by construction.
        self.items.sort_by(|a, b| {
            b.request
                .priority
                .cmp(&a.request.priority)
                .then(a.request.submitted_at.cmp(&b.request.submitted_at))
                .then(a.seq.cmp(&b.seq))
        });
    }

    /// Remove and return the first request whose required tags are a subset
    /// of `capabilities`.
    pub fn next_eligible(&mut self, capabilities: &BTreeSet<String>) -> Option<BuildRequest> {
        let pos = self
            .items
            .iter()
            .position(|item| item.request.required_capabilities.is_subset(capabilities))?;
        Some(self.items.remove(pos).request)
    }

    /// Remove a specific request (e.g. an operator cancelled it while queued).
    pub fn remove(&mut self, request_id: uuid::Uuid) -> Option<BuildRequest> {
        let pos = self
            .items
            .iter()
            .position(|item| item.request.request_id == request_id)?;
        Some(self.items.remove(pos).request)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for BuildQueue {
    fn default() -> Self {
        Self::new()
    }
}
