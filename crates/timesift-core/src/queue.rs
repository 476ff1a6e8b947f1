use parking_lot::Mutex;
use serde_json::{Map, Value};

/// A partial document update waiting to be applied.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingUpdate {
    pub index: String,
    pub event_type: String,
    pub event_id: String,
    pub fields: Map<String, Value>,
}

impl PendingUpdate {
    fn targets(&self, index: &str, event_id: &str) -> bool {
        self.index == index && self.event_id == event_id
    }
}

/// Batches partial document updates keyed by (index, document id).
///
/// Updates for a document that already has a pending entry are merged into
/// it, later fields overwriting earlier ones, so each flush writes every
/// document at most once. Entries keep their first-enqueued order.
#[derive(Debug, Default)]
pub struct MutationQueue {
    pending: Mutex<Vec<PendingUpdate>>,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an update. Returns the number of documents now pending.
    pub fn enqueue(
        &self,
        index: &str,
        event_type: &str,
        event_id: &str,
        fields: Map<String, Value>,
    ) -> usize {
        let mut pending = self.pending.lock();
        match pending.iter_mut().find(|u| u.targets(index, event_id)) {
            Some(existing) => existing.fields.extend(fields),
            None => pending.push(PendingUpdate {
                index: index.to_string(),
                event_type: event_type.to_string(),
                event_id: event_id.to_string(),
                fields,
            }),
        }
        pending.len()
    }

    /// Value of `field` in the pending update for a document, if any.
    pub fn pending_field(&self, index: &str, event_id: &str, field: &str) -> Option<Value> {
        self.pending
            .lock()
            .iter()
            .find(|u| u.targets(index, event_id))
            .and_then(|u| u.fields.get(field).cloned())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Take every pending update, leaving the queue empty.
    pub fn drain(&self) -> Vec<PendingUpdate> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Put updates back at the front of the queue after a failed flush.
    /// Anything enqueued since the drain is merged on top.
    pub fn restore(&self, updates: Vec<PendingUpdate>) {
        let mut pending = self.pending.lock();
        let newer = std::mem::replace(&mut *pending, updates);
        drop(pending);
        for u in newer {
            self.enqueue(&u.index, &u.event_type, &u.event_id, u.fields);
        }
    }
}
