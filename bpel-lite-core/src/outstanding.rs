//! Receive/pick ↔ reply matching for synchronous (request-response)
//! inbound operations.
//!
//! Tracks the receives/picks a running instance has armed and, once a
//! message arrives for one of them, the message exchange its eventual reply
//! must be written into. Rehydrated together with the process instance;
//! private to one in-memory execution, so no cross-instance locking.
//! One-way selectors never await a reply and are not indexed here.

use crate::error::EngineError;
use crate::types::{PartnerLinkInstance, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error};
use uuid::Uuid;

/// Identifies an outstanding request: a receive/pick/onMessage on a
/// synchronous operation still needing a reply.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct RequestIdTuple {
    partner_link: PartnerLinkInstance,
    operation: String,
    /// BPEL receive/reply disambiguator (empty when not declared).
    bpel_mex_id: String,
}

impl RequestIdTuple {
    fn of(selector: &Selector) -> Self {
        Self {
            partner_link: selector.partner_link_instance.clone(),
            operation: selector.operation.clone(),
            bpel_mex_id: selector.bpel_mex_id.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Entry {
    channel: String,
    selectors: Vec<Selector>,
    /// Message exchange awaiting the reply, set once a message is matched
    /// to this registration.
    mex_ref: Option<Uuid>,
}

/// In-memory index of armed receive/pick branches.
///
/// Invariant: every two-way selector of an entry maps back to that entry in
/// `by_rid`, and the entry is reachable from exactly one channel; removal
/// clears all cross-references together.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OutstandingRequestManager {
    entries: HashMap<u64, Entry>,
    next_entry: u64,
    by_rid: HashMap<RequestIdTuple, u64>,
    by_channel: HashMap<String, u64>,
}

impl OutstandingRequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan the selectors of a single about-to-be-armed pick/receive for a
    /// branch whose request-id tuple is already registered (or duplicated
    /// within the scan) among two-way selectors. Returns the index of the
    /// first offender; one-way selectors are exempt.
    pub fn find_conflict(&self, selectors: &[Selector]) -> Option<usize> {
        let mut working: std::collections::HashSet<RequestIdTuple> =
            self.by_rid.keys().cloned().collect();
        for (i, selector) in selectors.iter().enumerate() {
            if selector.one_way {
                continue;
            }
            let rid = RequestIdTuple::of(selector);
            if !working.insert(rid) {
                return Some(i);
            }
        }
        None
    }

    /// Register an armed receive/pick under its response channel.
    ///
    /// A duplicate channel or RID is an engine invariant violation (the
    /// caller runs [`find_conflict`](Self::find_conflict) first), reported
    /// as a fatal consistency error.
    pub fn register(&mut self, channel: &str, selectors: Vec<Selector>) -> Result<(), EngineError> {
        if self.by_channel.contains_key(channel) {
            let msg = format!("duplicate entry for response channel {channel}");
            error!("{msg}");
            return Err(EngineError::Consistency(msg));
        }
        for selector in selectors.iter().filter(|s| !s.one_way) {
            let rid = RequestIdTuple::of(selector);
            if self.by_rid.contains_key(&rid) {
                let msg = format!("duplicate entry for request id {rid:?}");
                error!("{msg}");
                return Err(EngineError::Consistency(msg));
            }
        }

        let id = self.next_entry;
        self.next_entry += 1;
        for selector in selectors.iter().filter(|s| !s.one_way) {
            self.by_rid.insert(RequestIdTuple::of(selector), id);
        }
        self.by_channel.insert(channel.to_string(), id);
        self.entries.insert(
            id,
            Entry {
                channel: channel.to_string(),
                selectors,
                mex_ref: None,
            },
        );
        Ok(())
    }

    /// Drop a registration without a reply — the pick timed out or a
    /// sibling branch fired first. Unknown channels are ignored.
    pub fn cancel(&mut self, channel: &str) {
        if let Some(id) = self.by_channel.remove(channel) {
            self.entries.remove(&id);
            self.by_rid.retain(|_, v| *v != id);
        }
    }

    /// Attach the message exchange whose reply this registration must
    /// eventually produce. Each entry is associated exactly once.
    pub fn associate(&mut self, channel: &str, mex_ref: Uuid) -> Result<(), EngineError> {
        let id = self.by_channel.get(channel).copied().ok_or_else(|| {
            let msg = format!("associate: no entry for response channel {channel}");
            error!("{msg}");
            EngineError::Consistency(msg)
        })?;
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| EngineError::Consistency(format!("associate: dangling entry {id}")))?;
        if entry.mex_ref.is_some() {
            let msg = format!("associate: duplicate association for channel {channel}");
            error!("{msg}");
            return Err(EngineError::Consistency(msg));
        }
        entry.mex_ref = Some(mex_ref);
        Ok(())
    }

    /// Release the registration matching a reply. Removes the entry from
    /// the channel index and from every sibling selector's RID in one step,
    /// returning the associated exchange. `None` means no match — the reply
    /// is unsolicited or the registration was already consumed; calling
    /// again after a successful release also yields `None`.
    pub fn release(
        &mut self,
        partner_link: &PartnerLinkInstance,
        operation: &str,
        bpel_mex_id: &str,
    ) -> Option<Uuid> {
        let rid = RequestIdTuple {
            partner_link: partner_link.clone(),
            operation: operation.to_string(),
            bpel_mex_id: bpel_mex_id.to_string(),
        };
        let Some(id) = self.by_rid.get(&rid).copied() else {
            debug!("release: rid {rid:?} not registered");
            return None;
        };
        let entry = self.entries.remove(&id)?;
        self.by_channel.remove(&entry.channel);
        self.by_rid.retain(|_, v| *v != id);
        entry.mex_ref
    }

    /// Drain every remaining registration (instance abandoned/terminated),
    /// returning the exchanges that got a message but no reply so the
    /// caller can fail them. Leaves the manager empty.
    pub fn release_all(&mut self) -> Vec<Uuid> {
        let mex_refs = self
            .entries
            .values()
            .filter_map(|e| e.mex_ref)
            .collect();
        self.entries.clear();
        self.by_rid.clear();
        self.by_channel.clear();
        mex_refs
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
