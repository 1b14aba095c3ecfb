use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::{context::DispatchContext, decision::DecisionOutput};

/// Content hashes of recently dispatched outreach, bounded by age and by count.
#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    capacity: usize,
    entries: Mutex<IndexMap<String, DateTime<Utc>>>,
}

impl DedupCache {
    /// Cache remembering up to `capacity` hashes for `window` each.
    #[must_use]
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            entries: Mutex::new(IndexMap::new()),
        }
    }

    /// Whether the hash was inserted within the window.
    #[must_use]
    pub fn contains(&self, hash: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .lock()
            .get(hash)
            .is_some_and(|at| now - *at < self.window)
    }

    /// Remembers a hash, evicting the oldest entries beyond capacity.
    pub fn insert(&self, hash: String, now: DateTime<Utc>) {
        let mut entries = self.entries.lock();
        entries.shift_remove(&hash);
        entries.insert(hash, now);
        while entries.len() > self.capacity {
            entries.shift_remove_index(0);
        }
    }

    /// Drops expired entries. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, at| now - *at < self.window);
        before - entries.len()
    }

    /// Number of retained hashes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hash of the customer-facing content of an output, scoped to the tenant and recipient.
/// Outputs without outreach text have no effective content to deduplicate.
#[must_use]
pub fn content_hash(output: &DecisionOutput, context: &DispatchContext) -> Option<String> {
    let texts = output.outreach_texts();
    if texts.is_empty() {
        return None;
    }
    let recipient = context
        .customer_id
        .as_deref()
        .or(context.conversation_id.as_deref())
        .unwrap_or("-");
    let mut hasher = Sha256::new();
    hasher.update(context.tenant_id.as_bytes());
    hasher.update([0]);
    hasher.update(recipient.as_bytes());
    for text in texts {
        hasher.update([0]);
        hasher.update(normalize(text).as_bytes());
    }
    Some(format!("{:x}", hasher.finalize()))
}
