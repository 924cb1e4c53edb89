//! Per-key serialization.
//!
//! Each `(user_id, flow_kind)` key gets a `KeySlot` with two locks:
//!
//! - `turn` orders step inputs. It is held for the whole step, including
//!   the provider call, so a second message cannot start until the first
//!   has committed.
//! - `gate` guards store commits. Entry and cancel take only this lock and
//!   therefore never wait on a provider call.
//!
//! Lock order is always `turn` then `gate`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::state::FlowKind;

#[derive(Debug, Default)]
pub struct KeySlot {
    pub turn: Mutex<()>,
    pub gate: Mutex<()>,
}

#[derive(Debug, Default)]
pub struct KeyLocks {
    slots: DashMap<(i64, FlowKind), Arc<KeySlot>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot for a key, created on first use.
    pub fn slot(&self, user_id: i64, kind: FlowKind) -> Arc<KeySlot> {
        self.slots
            .entry((user_id, kind))
            .or_insert_with(|| Arc::new(KeySlot::default()))
            .clone()
    }

    /// Drop slots nobody is holding. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
