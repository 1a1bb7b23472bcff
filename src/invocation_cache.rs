use std::collections::BTreeMap;

use tracing::{trace, warn};

type Action = Box<dyn FnOnce() + Send>;

/// Re-serializes asynchronously arriving completions into the order in which their invocation ids
///  were issued: an action runs only after the actions of all lower ids have run.
pub struct InvocationCache {
    next_invocation_id: i32,
    last_issued_id: i32,
    pending: BTreeMap<i32, Vec<Action>>,
}

impl Default for InvocationCache {
    fn default() -> Self {
        InvocationCache::new()
    }
}

impl InvocationCache {
    pub fn new() -> InvocationCache {
        InvocationCache {
            next_invocation_id: 1,
            last_issued_id: 0,
            pending: Default::default(),
        }
    }

    /// issues invocation ids, starting at 1
    pub fn next_id(&mut self) -> i32 {
        self.last_issued_id += 1;
        self.last_issued_id
    }

    /// number of actions waiting for a lower id
    pub fn count(&self) -> usize {
        self.pending.values()
            .map(|actions| actions.len())
            .sum()
    }

    pub fn reset(&mut self) {
        self.next_invocation_id = 1;
        self.last_issued_id = 0;
        self.pending.clear();
    }

    pub fn invoke(&mut self, invocation_id: i32, action: impl FnOnce() + Send + 'static) {
        if invocation_id < self.next_invocation_id {
            // caller error: stale or duplicate id. Running it keeps the action from getting lost.
            warn!("invocation id {} is below the next expected id {} - running it out of order", invocation_id, self.next_invocation_id);
            action();
            return;
        }

        if invocation_id > self.next_invocation_id {
            trace!("buffering invocation {} until {} has run", invocation_id, self.next_invocation_id);
            self.pending.entry(invocation_id)
                .or_default()
                .push(Box::new(action));
            return;
        }

        self.next_invocation_id += 1;
        action();

        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.next_invocation_id {
                break;
            }
            self.next_invocation_id += 1;
            for action in entry.remove() {
                action();
            }
        }
    }
}
