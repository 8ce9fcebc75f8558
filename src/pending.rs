//! Last desired value per mutating method, replayed after reconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde_json::Value;

/// Methods replayed first, in this order, on every flush.
pub const REPLAY_ORDER: [&str; 7] = [
    "set_power",
    "bg_set_power",
    "set_ct_abx",
    "set_hsv",
    "set_bright",
    "bg_set_hsv",
    "bg_set_bright",
];

/// A cached mutating command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingCommand {
    pub method: String,
    pub params: Vec<Value>,
}

/// At most one entry per method name; newer commands overwrite older ones.
#[derive(Debug, Clone, Default)]
pub struct PendingState {
    entries: HashMap<String, Vec<Value>>,
}

impl PendingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the desired value of `method`.
    pub fn upsert(&mut self, method: &str, params: Vec<Value>) {
        self.entries.insert(method.to_string(), params);
    }

    pub fn get(&self, method: &str) -> Option<&[Value]> {
        self.entries.get(method).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the cache in replay order.
    ///
    /// Methods from [`REPLAY_ORDER`] come first in that order; any other
    /// cached method follows, sorted by name.
    pub fn replay_order(&self) -> Vec<PendingCommand> {
        let mut others: Vec<&String> = self
            .entries
            .keys()
            .filter(|m| !REPLAY_ORDER.contains(&m.as_str()))
            .collect();
        others.sort();

        REPLAY_ORDER
            .iter()
            .copied()
            .chain(others.into_iter().map(String::as_str))
            .filter_map(|method| {
                self.entries.get(method).map(|params| PendingCommand {
                    method: method.to_string(),
                    params: params.clone(),
                })
            })
            .collect()
    }
}

/// Guard flag allowing at most one flush per session at a time.
#[derive(Debug, Default)]
pub struct Reconciler {
    running: AtomicBool,
}

impl Reconciler {
    /// Claim the flag; `None` if a flush is already running.
    pub fn try_begin(&self) -> Option<ReconcileGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReconcileGuard { flag: &self.running })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases the reconciling flag when dropped.
#[derive(Debug)]
pub struct ReconcileGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ReconcileGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
