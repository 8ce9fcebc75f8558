//! Request correlation and the retry/backoff schedule of the command dispatcher.
//!
//! The retry loop itself runs inside [`DeviceSession`](crate::DeviceSession);
//! this module owns the pieces it is built from:
//!
//! - [`Command`]: one logical request with a process-unique id
//! - [`RetryPolicy`] / [`Retry`]: a bounded state machine deciding, after each
//!   failed attempt, whether to retry (and with which deadline) or stop
//! - [`InFlight`]: the table of requests waiting for a correlated response

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures::channel::oneshot;
use serde_json::Value;

use crate::config::SessionConfig;
use crate::errors::Error;
use crate::protocol::DeviceError;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Issue a request id that is unique within the process.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Whether a command changes device state or only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Desired state; cached and replayed after reconnects, never fails visibly.
    Mutating,
    /// Read-only; failures surface to the caller.
    Query,
}

/// A logical request ready to be framed onto the control channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
    pub kind: CommandKind,
}

impl Command {
    /// Build a command with a freshly issued id.
    pub fn new(method: impl Into<String>, params: Vec<Value>, kind: CommandKind) -> Self {
        Command {
            id: next_request_id(),
            method: method.into(),
            params,
            kind,
        }
    }
}

/// Attempt budget and deadline schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retries: u32,
    base_timeout: Duration,
}

impl From<&SessionConfig> for RetryPolicy {
    fn from(config: &SessionConfig) -> Self {
        RetryPolicy::new(config.retries, config.base_timeout)
    }
}

impl RetryPolicy {
    // Keeps `base << attempt` from overflowing on absurd retry counts.
    const MAX_SHIFT: u32 = 20;

    pub fn new(retries: u32, base_timeout: Duration) -> Self {
        RetryPolicy {
            retries,
            base_timeout,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Deadline of attempt `index`: the base timeout doubled `index` times.
    pub fn deadline(&self, index: u32) -> Duration {
        self.base_timeout * (1u32 << index.min(Self::MAX_SHIFT))
    }

    /// Sum of all per-attempt deadlines.
    pub fn worst_case(&self) -> Duration {
        (0..=self.retries).map(|i| self.deadline(i)).sum()
    }

    /// Start a fresh retry sequence.
    pub fn start(&self) -> Retry {
        Retry {
            policy: *self,
            current: Attempt {
                index: 0,
                deadline: self.deadline(0),
            },
        }
    }
}

/// One transmission attempt of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub index: u32,
    pub deadline: Duration,
}

/// What to do after an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Try again with the given attempt.
    Retry(Attempt),
    /// The device declined the request; retrying would not change its answer.
    Rejected,
    /// The host is unreachable; the remaining budget is skipped.
    Abort,
    /// Every attempt failed.
    Exhausted,
}

/// Progress through a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Retry {
    policy: RetryPolicy,
    current: Attempt,
}

impl Retry {
    /// The attempt to run now.
    pub fn current(&self) -> Attempt {
        self.current
    }

    /// Classify the failure of the current attempt and advance.
    pub fn on_failure(&mut self, err: &Error) -> Verdict {
        if matches!(err, Error::Device { .. }) {
            return Verdict::Rejected;
        }
        if err.is_unreachable() {
            return Verdict::Abort;
        }
        if self.current.index >= self.policy.retries {
            return Verdict::Exhausted;
        }
        let index = self.current.index + 1;
        self.current = Attempt {
            index,
            deadline: self.policy.deadline(index),
        };
        Verdict::Retry(self.current)
    }
}

/// Outcome delivered to a waiting request.
pub type Reply = Result<Vec<Value>, DeviceError>;

/// Requests awaiting a correlated response, keyed by request id.
#[derive(Debug, Default)]
pub struct InFlight {
    requests: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a waiter for `id`; a previous waiter for the same id is dropped.
    pub fn register(&self, id: u64) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    /// Deliver a response. Returns `false` if nobody waits for `id` any more.
    pub fn resolve(&self, id: u64, reply: Reply) -> bool {
        match self.lock().remove(&id) {
            // The waiter may have given up between lookup and send; that is fine.
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Forget a waiter whose deadline fired.
    pub fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Abandon every waiter; each observes a cancelled channel.
    pub fn abandon_all(&self) -> usize {
        let mut requests = self.lock();
        let count = requests.len();
        requests.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io;

    fn transient() -> Error {
        Error::TimedOut { id: 1 }
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Command::new("get_prop", vec![], CommandKind::Query);
        let b = Command::new("get_prop", vec![], CommandKind::Query);
        assert!(b.id > a.id);
    }

    #[test]
    fn test_deadlines_double() {
        let policy = RetryPolicy::from(&SessionConfig::default());
        let deadlines: Vec<u64> = (0..=5).map(|i| policy.deadline(i).as_millis() as u64).collect();
        assert_eq!(deadlines, vec![100, 200, 400, 800, 1600, 3200]);
        assert_eq!(policy.worst_case(), Duration::from_millis(6300));
    }

    #[test]
    fn test_retry_schedule_exhausts() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        let mut retry = policy.start();
        let mut seen = vec![retry.current().deadline];

        loop {
            match retry.on_failure(&transient()) {
                Verdict::Retry(attempt) => seen.push(attempt.deadline),
                Verdict::Exhausted => break,
                other => panic!("unexpected verdict {other:?}"),
            }
        }

        assert_eq!(seen.len(), 6);
        assert_eq!(seen.last(), Some(&Duration::from_millis(3200)));
    }

    #[test]
    fn test_unreachable_aborts_immediately() {
        let mut retry = RetryPolicy::new(5, Duration::from_millis(100)).start();
        let err = Error::socket(
            "connect",
            io::Error::new(io::ErrorKind::HostUnreachable, "no route to host"),
        );
        assert_eq!(retry.on_failure(&err), Verdict::Abort);
        assert_eq!(retry.current().index, 0);
    }

    #[test]
    fn test_device_error_is_not_retried() {
        let mut retry = RetryPolicy::new(5, Duration::from_millis(100)).start();
        let err = Error::Device {
            id: 1,
            code: -1,
            message: "method not supported".into(),
        };
        assert_eq!(retry.on_failure(&err), Verdict::Rejected);
    }

    #[test]
    fn test_zero_retries() {
        let mut retry = RetryPolicy::new(0, Duration::from_millis(100)).start();
        assert_eq!(retry.on_failure(&transient()), Verdict::Exhausted);
    }

    #[test]
    fn test_in_flight_resolution() {
        let table = InFlight::default();
        let mut rx = table.register(42);
        assert_eq!(table.len(), 1);

        assert!(table.resolve(42, Ok(vec![json!("ok")])));
        assert!(table.is_empty());
        assert_eq!(rx.try_recv().unwrap(), Some(Ok(vec![json!("ok")])));

        // Late duplicate for an id that is gone.
        assert!(!table.resolve(42, Ok(vec![])));
    }

    #[test]
    fn test_abandon_all_cancels_waiters() {
        let table = InFlight::default();
        let mut rx = table.register(7);
        assert_eq!(table.abandon_all(), 1);
        assert!(rx.try_recv().is_err());
    }
}
