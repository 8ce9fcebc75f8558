//! Identity-keyed collection of device sessions.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use log::{debug, info};

use crate::config::SessionConfig;
use crate::discovery::DeviceRecord;
use crate::session::DeviceSession;
use crate::types::DeviceId;

/// Owns every [`DeviceSession`], keyed by device identity.
///
/// Sessions are created lazily the first time an identity is reported and
/// then reused for the lifetime of the registry, across endpoint changes.
#[derive(Default)]
pub struct SessionRegistry {
    config: SessionConfig,
    sessions: Mutex<HashMap<DeviceId, DeviceSession>>,
    blocked: Mutex<HashSet<DeviceId>>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        SessionRegistry {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<DeviceId, DeviceSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn blocked(&self) -> MutexGuard<'_, HashSet<DeviceId>> {
        self.blocked.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the session for `record`, creating it on first sight.
    ///
    /// A known identity keeps its session; only its endpoint is updated.
    /// Returns `None` for identities that were removed from the registry.
    pub async fn create_or_update(&self, record: &DeviceRecord) -> Option<DeviceSession> {
        if self.is_blocked(&record.identity) {
            debug!("ignoring blocked device {}", record.identity);
            return None;
        }

        let existing = self.get(&record.identity);
        if let Some(session) = existing {
            session.update_endpoint(record.endpoint.clone()).await;
            return Some(session);
        }

        let session = self
            .sessions()
            .entry(record.identity.clone())
            .or_insert_with(|| {
                info!(
                    "new {} device {} at {}",
                    record.model, record.identity, record.endpoint
                );
                DeviceSession::new(
                    record.identity.clone(),
                    &record.model,
                    record.endpoint.clone(),
                    &self.config,
                )
            })
            .clone();
        Some(session)
    }

    pub fn get(&self, identity: &DeviceId) -> Option<DeviceSession> {
        self.sessions().get(identity).cloned()
    }

    /// Drop the session of `identity` and refuse to recreate it.
    ///
    /// The socket is closed; pending desired state is discarded with the session.
    pub async fn remove(&self, identity: &DeviceId) -> Option<DeviceSession> {
        self.blocked().insert(identity.clone());
        let removed = self.sessions().remove(identity);
        if let Some(session) = &removed {
            info!("removed device {identity}");
            session.disconnect().await;
        }
        removed
    }

    /// Allow a removed identity to be created again.
    pub fn unblock(&self, identity: &DeviceId) -> bool {
        self.blocked().remove(identity)
    }

    pub fn is_blocked(&self, identity: &DeviceId) -> bool {
        self.blocked().contains(identity)
    }

    pub fn contains(&self, identity: &DeviceId) -> bool {
        self.sessions().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Identities of every registered session, sorted.
    pub fn identities(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Clones of every registered session.
    pub fn sessions_snapshot(&self) -> Vec<DeviceSession> {
        self.sessions().values().cloned().collect()
    }
}
