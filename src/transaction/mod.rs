//! Correlation of outbound commands with inbound responses.
//!
//! One tracker is shared by every command/response protocol. A pending
//! transaction is keyed by `(target entity, sequence id)`; the caller keeps a
//! stable [`TransactionHandle`] that survives the sequence id changes made by
//! retries.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{AvdeccError, Result};
use crate::types::EntityId;


/// Number of completed keys remembered to recognise duplicate responses
const RECENT_WINDOW: usize = 64;

/// Stable identifier of a pending transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionHandle(u64);

/// Key a response is matched on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    /// Entity the command was addressed to
    pub target: EntityId,
    /// Sequence id of the current attempt
    pub sequence_id: u16,
}

#[derive(Debug)]
struct PendingTransaction<C> {
    key: TransactionKey,
    context: C,
    retry_count: u8,
    max_retries: u8,
    timeout: Duration,
    deadline: Instant,
}

/// Outcome of offering a response to the tracker
#[derive(Debug)]
pub enum Completion<C> {
    /// The response belongs to this transaction, which is now finished
    Matched {
        /// Handle returned by `begin`
        handle: TransactionHandle,
        /// Context stored by `begin`
        context: C,
    },
    /// A response for a transaction that already completed
    Duplicate,
    /// No transaction ever matched or it was superseded by a retry
    Unmatched,
}

/// Expired transaction reported by [`TransactionTracker::poll_expired`]
#[derive(Debug)]
pub enum Expiry<C> {
    /// The command must be sent again with a fresh sequence id
    Retry {
        /// Transaction handle
        handle: TransactionHandle,
        /// Entity to resend to
        target: EntityId,
        /// Sequence id to put in the resent command
        sequence_id: u16,
        /// Retries done so far, including this one
        attempt: u8,
    },
    /// All retries are exhausted and the slot was freed
    TimedOut {
        /// Transaction handle
        handle: TransactionHandle,
        /// Entity that never answered
        target: EntityId,
        /// Context stored by `begin`
        context: C,
    },
}

/// Tracker of outstanding commands with retry and timeout policy
#[derive(Debug)]
pub struct TransactionTracker<C> {
    name: &'static str,
    capacity: usize,
    next_handle: u64,
    sequence_ids: HashMap<EntityId, u16>,
    pending: HashMap<TransactionHandle, PendingTransaction<C>>,
    by_key: HashMap<TransactionKey, TransactionHandle>,
    recent: VecDeque<TransactionKey>,
}

impl<C> TransactionTracker<C> {
    /// Create a tracker named `name` (used in logs) holding at most
    /// `capacity` outstanding transactions
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            next_handle: 1,
            sequence_ids: HashMap::new(),
            pending: HashMap::new(),
            by_key: HashMap::new(),
            recent: VecDeque::with_capacity(RECENT_WINDOW),
        }
    }

    /// Number of outstanding transactions
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is outstanding
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Maximum number of outstanding transactions
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `begin` would be rejected
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    /// Whether the handle is still outstanding
    #[must_use]
    pub fn contains(&self, handle: TransactionHandle) -> bool {
        self.pending.contains_key(&handle)
    }

    /// Current key of a pending transaction
    #[must_use]
    pub fn key(&self, handle: TransactionHandle) -> Option<TransactionKey> {
        self.pending.get(&handle).map(|p| p.key)
    }

    /// Context of a pending transaction
    #[must_use]
    pub fn context(&self, handle: TransactionHandle) -> Option<&C> {
        self.pending.get(&handle).map(|p| &p.context)
    }

    /// Mutable context of a pending transaction
    pub fn context_mut(&mut self, handle: TransactionHandle) -> Option<&mut C> {
        self.pending.get_mut(&handle).map(|p| &mut p.context)
    }

    /// Pending transaction currently using `(target, sequence_id)`
    #[must_use]
    pub fn lookup(&self, target: EntityId, sequence_id: u16) -> Option<(TransactionHandle, &C)> {
        let handle = *self.by_key.get(&TransactionKey {
            target,
            sequence_id,
        })?;
        self.pending.get(&handle).map(|p| (handle, &p.context))
    }

    /// Handles of every outstanding transaction
    #[must_use]
    pub fn handles(&self) -> Vec<TransactionHandle> {
        let mut handles: Vec<_> = self.pending.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Earliest deadline among outstanding transactions
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Allocate the next sequence id for `target`, skipping ids still in use
    fn allocate_sequence_id(&mut self, target: EntityId) -> u16 {
        let counter = self.sequence_ids.entry(target).or_insert(0);
        loop {
            let candidate = *counter;
            *counter = counter.wrapping_add(1);
            let key = TransactionKey {
                target,
                sequence_id: candidate,
            };
            if !self.by_key.contains_key(&key) {
                return candidate;
            }
        }
    }

    /// Register a new outstanding command.
    ///
    /// Returns the handle and the sequence id to put in the command.
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::NoResources` when the tracker is full.
    pub fn begin(
        &mut self,
        target: EntityId,
        timeout: Duration,
        max_retries: u8,
        now: Instant,
        context: C,
    ) -> Result<(TransactionHandle, u16)> {
        if self.pending.len() >= self.capacity {
            warn!(
                tracker = self.name,
                capacity = self.capacity,
                %target,
                "no free transaction slot"
            );
            return Err(AvdeccError::NoResources {
                capacity: self.capacity,
            });
        }
        let sequence_id = self.allocate_sequence_id(target);
        let handle = TransactionHandle(self.next_handle);
        self.next_handle += 1;
        let key = TransactionKey {
            target,
            sequence_id,
        };
        self.by_key.insert(key, handle);
        self.pending.insert(
            handle,
            PendingTransaction {
                key,
                context,
                retry_count: 0,
                max_retries,
                timeout,
                deadline: now + timeout,
            },
        );
        debug!(tracker = self.name, %target, sequence_id, "transaction started");
        Ok((handle, sequence_id))
    }

    /// Offer a response identified by `(target, sequence_id)`
    pub fn complete(&mut self, target: EntityId, sequence_id: u16) -> Completion<C> {
        let key = TransactionKey {
            target,
            sequence_id,
        };
        let Some(handle) = self.by_key.remove(&key) else {
            if self.recent.contains(&key) {
                warn!(
                    tracker = self.name,
                    %target,
                    sequence_id,
                    "duplicate response discarded"
                );
                return Completion::Duplicate;
            }
            debug!(tracker = self.name, %target, sequence_id, "unmatched response discarded");
            return Completion::Unmatched;
        };
        let Some(pending) = self.pending.remove(&handle) else {
            return Completion::Unmatched;
        };
        if self.recent.len() == RECENT_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(key);
        debug!(tracker = self.name, %target, sequence_id, "transaction completed");
        Completion::Matched {
            handle,
            context: pending.context,
        }
    }

    /// Restart the timeout window of a transaction after an IN_PROGRESS
    /// response. The retry counter is left unchanged.
    ///
    /// Returns `false` if nothing is pending under that key.
    pub fn extend(&mut self, target: EntityId, sequence_id: u16, now: Instant) -> bool {
        let key = TransactionKey {
            target,
            sequence_id,
        };
        let Some(pending) = self
            .by_key
            .get(&key)
            .and_then(|handle| self.pending.get_mut(handle))
        else {
            return false;
        };
        pending.deadline = now + pending.timeout;
        debug!(tracker = self.name, %target, sequence_id, "transaction in progress");
        true
    }

    /// Drop a pending transaction without waiting for its response
    pub fn cancel(&mut self, handle: TransactionHandle) -> Option<C> {
        let pending = self.pending.remove(&handle)?;
        self.by_key.remove(&pending.key);
        debug!(
            tracker = self.name,
            target = %pending.key.target,
            sequence_id = pending.key.sequence_id,
            "transaction cancelled"
        );
        Some(pending.context)
    }

    /// Cancel every transaction addressed to `target`
    pub fn cancel_target(&mut self, target: EntityId) -> Vec<(TransactionHandle, C)> {
        let handles: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, p)| p.key.target == target)
            .map(|(h, _)| *h)
            .collect();
        handles
            .into_iter()
            .filter_map(|h| self.cancel(h).map(|c| (h, c)))
            .collect()
    }

    /// Handle every transaction whose deadline has passed.
    ///
    /// Transactions with retries left get a new sequence id and deadline;
    /// the others are removed and reported as timed out.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<Expiry<C>> {
        let mut expired: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(h, _)| *h)
            .collect();
        expired.sort_unstable();

        let mut out = Vec::with_capacity(expired.len());
        for handle in expired {
            let Some(pending) = self.pending.get(&handle) else {
                continue;
            };
            let old_key = pending.key;
            let exhausted = pending.retry_count >= pending.max_retries;
            self.by_key.remove(&old_key);

            if exhausted {
                if let Some(pending) = self.pending.remove(&handle) {
                    warn!(
                        tracker = self.name,
                        target = %old_key.target,
                        sequence_id = old_key.sequence_id,
                        retries = pending.retry_count,
                        "transaction timed out"
                    );
                    out.push(Expiry::TimedOut {
                        handle,
                        target: old_key.target,
                        context: pending.context,
                    });
                }
                continue;
            }

            let sequence_id = self.allocate_sequence_id(old_key.target);
            let key = TransactionKey {
                target: old_key.target,
                sequence_id,
            };
            self.by_key.insert(key, handle);
            if let Some(pending) = self.pending.get_mut(&handle) {
                pending.key = key;
                pending.retry_count += 1;
                pending.deadline = now + pending.timeout;
                debug!(
                    tracker = self.name,
                    target = %key.target,
                    sequence_id,
                    attempt = pending.retry_count,
                    "command timeout, retrying"
                );
                out.push(Expiry::Retry {
                    handle,
                    target: key.target,
                    sequence_id,
                    attempt: pending.retry_count,
                });
            }
        }
        out
    }
}
