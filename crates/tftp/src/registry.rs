//! Session Registry
//!
//! Maps a transfer ID to the state of the transfer it identifies. A TID is
//! the peer's full socket address; two clients behind the same port on
//! different hosts are distinct transfers.
//!
//! The registry is a plain map owned by one task. No ordering is kept.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;

use thiserror::Error;

/// Transfer identifier
pub type Tid = SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a session for {0} already exists")]
    AlreadyExists(Tid),
}

#[derive(Debug)]
pub struct Registry<S> {
    sessions: HashMap<Tid, S>,
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }
}

impl<S> Registry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, tid: &Tid) -> Option<&S> {
        self.sessions.get(tid)
    }

    pub fn find_mut(&mut self, tid: &Tid) -> Option<&mut S> {
        self.sessions.get_mut(tid)
    }

    /// Insert a new session. The TID must not be registered yet.
    pub fn create(&mut self, tid: Tid, session: S) -> Result<&mut S, RegistryError> {
        match self.sessions.entry(tid) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyExists(tid)),
            Entry::Vacant(entry) => Ok(entry.insert(session)),
        }
    }

    pub fn remove(&mut self, tid: &Tid) -> Option<S> {
        self.sessions.remove(tid)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn tids(&self) -> impl Iterator<Item = Tid> + '_ {
        self.sessions.keys().copied()
    }
}
