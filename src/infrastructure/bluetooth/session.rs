//! Session Manager
//!
//! Owns the connected-peripheral sessions (at most [`MAX_SESSIONS`]) and
//! drives each through its lifecycle:
//!
//! ```text
//! Idle → Connecting → Discovering → Ready → Disconnecting → Closed
//!            │             │
//!            └─────────────┴──────────→ Closed   (transport failure / cancel)
//! ```
//!
//! The session table is the only shared mutable state. Guards and inserts
//! happen under one lock that is never held across an await; every
//! in-flight connect carries an attempt id so a late transport completion
//! can't resurrect a session that was closed in the meantime.

use crate::domain::errors::{ConnectError, TransportError};
use crate::domain::models::{AppEvent, PeripheralHandle, Session, SessionState, Side};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::transport::BleTransport;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Maximum concurrent sessions (one per side)
pub const MAX_SESSIONS: usize = 2;

/// GATT identifiers every session binds to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub service_id: String,
    pub characteristic_id: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_id: protocol::SERVICE_UUID.to_string(),
            characteristic_id: protocol::DATA_CHAR_UUID.to_string(),
        }
    }
}

struct SessionEntry<P> {
    session: Session,
    attempt: u64,
    peer: Option<P>,
}

struct SessionTable<P> {
    // Connection order
    entries: Vec<SessionEntry<P>>,
    next_attempt: u64,
}

impl<P> SessionTable<P> {
    fn find(&self, peripheral_id: &str) -> Option<&SessionEntry<P>> {
        self.entries
            .iter()
            .find(|e| e.session.peripheral_id == peripheral_id)
    }

    /// The entry for this attempt, if it is still the live one
    fn attempt_mut(&mut self, peripheral_id: &str, attempt: u64) -> Option<&mut SessionEntry<P>> {
        self.entries
            .iter_mut()
            .find(|e| e.session.peripheral_id == peripheral_id && e.attempt == attempt)
    }

    fn remove_attempt(&mut self, peripheral_id: &str, attempt: u64) -> Option<SessionEntry<P>> {
        let index = self
            .entries
            .iter()
            .position(|e| e.session.peripheral_id == peripheral_id && e.attempt == attempt)?;
        Some(self.entries.remove(index))
    }
}

pub struct SessionManager<T: BleTransport> {
    transport: Arc<T>,
    config: SessionConfig,
    table: Mutex<SessionTable<T::Peer>>,
    scanner: Option<Arc<BleScanner<T>>>,
    event_sender: Option<mpsc::UnboundedSender<AppEvent>>,
}

impl<T: BleTransport> SessionManager<T> {
    pub fn new(transport: Arc<T>, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            table: Mutex::new(SessionTable {
                entries: Vec::new(),
                next_attempt: 0,
            }),
            scanner: None,
            event_sender: None,
        }
    }

    /// Scanner to halt once a session becomes ready and on shutdown
    pub fn with_scanner(mut self, scanner: Arc<BleScanner<T>>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_events(mut self, event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    fn lock(&self) -> MutexGuard<'_, SessionTable<T::Peer>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session to `handle`, placed on `side`.
    ///
    /// Resolves once the session is Ready. On any failure the session is
    /// discarded and nothing is left in the table.
    pub async fn connect(
        &self,
        handle: &PeripheralHandle,
        side: Side,
    ) -> Result<Session, ConnectError> {
        let peripheral_id = handle.id.as_str();

        let attempt = {
            let mut table = self.lock();
            if table.find(peripheral_id).is_some() {
                warn!("Device {} already connected", peripheral_id);
                return Err(ConnectError::AlreadyConnected(peripheral_id.to_string()));
            }
            let live = table
                .entries
                .iter()
                .filter(|e| e.session.state.is_live())
                .count();
            if live >= MAX_SESSIONS {
                warn!("Maximum {} devices already connected", MAX_SESSIONS);
                return Err(ConnectError::CapacityExceeded { max: MAX_SESSIONS });
            }
            if table.entries.iter().any(|e| e.session.side == side) {
                warn!("Side {} already in use", side);
                return Err(ConnectError::SideTaken(side));
            }

            table.next_attempt += 1;
            let attempt = table.next_attempt;
            table.entries.push(SessionEntry {
                session: Session {
                    peripheral_id: peripheral_id.to_string(),
                    side,
                    service_id: self.config.service_id.clone(),
                    characteristic_id: self.config.characteristic_id.clone(),
                    state: SessionState::Connecting,
                },
                attempt,
                peer: None,
            });
            attempt
        };

        info!(
            "Connecting to {} ({}) as {}",
            handle.display_name(),
            peripheral_id,
            side
        );
        self.emit_state(peripheral_id, side, SessionState::Connecting);

        // Step 1: Connect to BLE device
        let peer = match self.transport.connect(peripheral_id).await {
            Ok(peer) => peer,
            Err(e) => return Err(self.fail(peripheral_id, side, attempt, e)),
        };

        if !self.advance(peripheral_id, attempt, SessionState::Discovering, Some(peer.clone())) {
            return Err(self.abandon(peripheral_id, attempt));
        }
        self.emit_state(peripheral_id, side, SessionState::Discovering);

        // Step 2: Enumerate services and characteristics
        if let Err(e) = self
            .transport
            .discover_services_and_characteristics(&peer)
            .await
        {
            self.cancel_unclaimed(peripheral_id, attempt);
            return Err(self.fail(peripheral_id, side, attempt, e));
        }

        if !self.advance(peripheral_id, attempt, SessionState::Ready, None) {
            return Err(self.abandon(peripheral_id, attempt));
        }

        let session = Session {
            peripheral_id: peripheral_id.to_string(),
            side,
            service_id: self.config.service_id.clone(),
            characteristic_id: self.config.characteristic_id.clone(),
            state: SessionState::Ready,
        };

        info!("Session ready: {} ({})", peripheral_id, side);
        self.emit_state(peripheral_id, side, SessionState::Ready);

        if let Some(scanner) = &self.scanner {
            scanner.stop();
        }

        Ok(session)
    }

    /// Move a still-current attempt to `state`. False if it was closed meanwhile.
    fn advance(
        &self,
        peripheral_id: &str,
        attempt: u64,
        state: SessionState,
        peer: Option<T::Peer>,
    ) -> bool {
        let mut table = self.lock();
        match table.attempt_mut(peripheral_id, attempt) {
            Some(entry) => {
                entry.session.state = state;
                if peer.is_some() {
                    entry.peer = peer;
                }
                true
            }
            None => false,
        }
    }

    fn fail(
        &self,
        peripheral_id: &str,
        side: Side,
        attempt: u64,
        cause: TransportError,
    ) -> ConnectError {
        error!("Failed to connect to {}: {}", peripheral_id, cause);
        if self.lock().remove_attempt(peripheral_id, attempt).is_some() {
            self.emit_state(peripheral_id, side, SessionState::Closed);
        }
        ConnectError::TransportFailure(cause)
    }

    // The attempt was torn down while a transport call was pending; its
    // Closed state stands and the late connection is dropped.
    fn abandon(&self, peripheral_id: &str, attempt: u64) -> ConnectError {
        info!("Connect to {} cancelled while in flight", peripheral_id);
        self.cancel_unclaimed(peripheral_id, attempt);
        ConnectError::Cancelled
    }

    /// Drop the link opened by `attempt`, unless a newer attempt on the same
    /// peripheral now owns it.
    fn cancel_unclaimed(&self, peripheral_id: &str, attempt: u64) {
        let claimed = self
            .lock()
            .find(peripheral_id)
            .is_some_and(|e| e.attempt != attempt);
        if claimed {
            debug!(
                "Link to {} belongs to a newer attempt, leaving it open",
                peripheral_id
            );
            return;
        }
        self.transport.cancel_connection(peripheral_id);
    }

    /// Tear down one session, or all of them when `peripheral_id` is None.
    /// Unknown or already closed ids are ignored.
    pub fn disconnect(&self, peripheral_id: Option<&str>) {
        let removed: Vec<SessionEntry<T::Peer>> = {
            let mut table = self.lock();
            match peripheral_id {
                Some(id) => match table.entries.iter().position(|e| e.session.peripheral_id == id) {
                    Some(index) => vec![table.entries.remove(index)],
                    None => Vec::new(),
                },
                None => table.entries.drain(..).collect(),
            }
        };

        if removed.is_empty() {
            debug!("Nothing to disconnect for {:?}", peripheral_id);
            return;
        }

        for entry in removed {
            let session = entry.session;
            if session.state == SessionState::Ready {
                self.emit_state(&session.peripheral_id, session.side, SessionState::Disconnecting);
            }
            self.transport.cancel_connection(&session.peripheral_id);
            self.emit_state(&session.peripheral_id, session.side, SessionState::Closed);
            info!("Disconnected from {} ({})", session.peripheral_id, session.side);
        }
    }

    /// Close every session and halt any scan
    pub fn shutdown(&self) {
        self.disconnect(None);
        if let Some(scanner) = &self.scanner {
            scanner.stop();
        }
    }

    /// Current state; None once closed or never opened
    pub fn state(&self, peripheral_id: &str) -> Option<SessionState> {
        self.lock().find(peripheral_id).map(|e| e.session.state)
    }

    /// Live sessions in connection order
    pub fn sessions(&self) -> Vec<Session> {
        self.lock()
            .entries
            .iter()
            .map(|e| e.session.clone())
            .collect()
    }

    pub fn ready_sessions(&self) -> Vec<Session> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.session.state == SessionState::Ready)
            .map(|e| e.session.clone())
            .collect()
    }

    pub fn ready_count(&self) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.session.state == SessionState::Ready)
            .count()
    }

    pub fn session_for_side(&self, side: Side) -> Option<Session> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.session.side == side)
            .map(|e| e.session.clone())
    }

    /// Peer of a Ready session
    pub fn ready_peer(&self, peripheral_id: &str) -> Option<T::Peer> {
        self.lock()
            .find(peripheral_id)
            .filter(|e| e.session.state == SessionState::Ready)
            .and_then(|e| e.peer.clone())
    }

    fn emit_state(&self, peripheral_id: &str, side: Side, state: SessionState) {
        debug!("Session {} ({}) -> {:?}", peripheral_id, side, state);
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(AppEvent::SessionStateChanged {
                peripheral_id: peripheral_id.to_string(),
                side,
                state,
            });
        }
    }
}

impl<T: BleTransport> Drop for SessionManager<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
