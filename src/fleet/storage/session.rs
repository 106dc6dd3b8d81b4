//! DashMap-based registry session storage.

use std::sync::Arc;

use dashmap::DashMap;
use russh::client;

use crate::fleet::session::SshClientHandler;
use crate::fleet::types::SessionInfo;

use super::traits::{SessionRef, SessionStorage, StoredSession};

impl From<&StoredSession> for SessionRef {
    fn from(stored: &StoredSession) -> Self {
        SessionRef {
            info: stored.info.clone(),
            handle: stored.handle.clone(),
            channels: stored.channels.clone(),
        }
    }
}

impl From<StoredSession> for SessionRef {
    fn from(stored: StoredSession) -> Self {
        SessionRef {
            info: stored.info,
            handle: stored.handle,
            channels: stored.channels,
        }
    }
}

/// DashMap-based implementation of `SessionStorage`, keyed by host id.
#[derive(Default)]
pub struct DashMapSessionStorage {
    sessions: DashMap<String, StoredSession>,
}

impl DashMapSessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for DashMapSessionStorage {
    fn insert(&self, host_id: String, session: StoredSession) -> Option<SessionRef> {
        self.sessions.insert(host_id, session).map(SessionRef::from)
    }

    fn get(&self, host_id: &str) -> Option<SessionRef> {
        self.sessions
            .get(host_id)
            .map(|entry| SessionRef::from(entry.value()))
    }

    fn remove(&self, host_id: &str) -> Option<SessionRef> {
        self.sessions
            .remove(host_id)
            .map(|(_, stored)| SessionRef::from(stored))
    }

    fn remove_if_handle(
        &self,
        host_id: &str,
        handle: &Arc<client::Handle<SshClientHandler>>,
    ) -> Option<SessionRef> {
        self.sessions
            .remove_if(host_id, |_, stored| Arc::ptr_eq(&stored.handle, handle))
            .map(|(_, stored)| SessionRef::from(stored))
    }

    fn contains(&self, host_id: &str) -> bool {
        self.sessions.contains_key(host_id)
    }

    fn host_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| entry.info.clone())
            .collect()
    }
}
