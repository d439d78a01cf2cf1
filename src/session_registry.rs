use std::net::SocketAddr;
use std::sync::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;
use crate::error::{EngineError, EngineResult};

/// Where to reach a peer, as negotiated by whatever established connectivity (e.g. ICE): the
///  address and, if known, the MTU of the path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub addr: SocketAddr,
    pub mtu: Option<usize>,
}

impl PeerEndpoint {
    pub fn new(addr: SocketAddr) -> PeerEndpoint {
        PeerEndpoint { addr, mtu: None }
    }
}

#[derive(Default)]
struct SessionRegistryInner {
    sessions: FxHashMap<u32, PeerEndpoint>,
    next_id: u32,
    is_shut_down: bool,
}

/// Registry of peer endpoints that were negotiated out of band, identified by a session id.
///
/// This is an explicitly constructed object that is passed to whoever needs it, with an
///  explicit end of life through [SessionRegistry::shutdown].
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<SessionRegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    pub fn allocate_session(&self, endpoint: PeerEndpoint) -> EngineResult<u32> {
        let mut inner = self.inner.lock().map_err(|_| EngineError::PeerClosed)?;
        if inner.is_shut_down {
            return Err(EngineError::PeerClosed);
        }

        let mut id = inner.next_id;
        while inner.sessions.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);
        inner.sessions.insert(id, endpoint);

        debug!("allocated session {} for {:?}", id, endpoint);
        Ok(id)
    }

    /// Returns the endpoint of the removed session, if there was one
    pub fn deallocate_session(&self, session_id: u32) -> Option<PeerEndpoint> {
        let result = self.inner.lock().ok()?.sessions.remove(&session_id);
        debug!("deallocated session {}: {:?}", session_id, result);
        result
    }

    pub fn endpoint(&self, session_id: u32) -> Option<PeerEndpoint> {
        self.inner.lock().ok()?.sessions.get(&session_id).copied()
    }

    pub fn num_sessions(&self) -> usize {
        self.inner.lock()
            .map(|inner| inner.sessions.len())
            .unwrap_or(0)
    }

    /// Discard all sessions; later allocations fail with `PeerClosed`
    pub fn shutdown(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            debug!("shutting down session registry with {} sessions", inner.sessions.len());
            inner.is_shut_down = true;
            inner.sessions.clear();
        }
    }
}
