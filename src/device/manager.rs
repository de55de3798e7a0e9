use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use super::catalog::PortCatalog;
use super::models::{Session, SessionInfo};
use crate::serial::{BaudRate, PortIdentifier, Result, SerialError, TransferConfig};

/// Central session management.
/// Owns the exclusive claim on every port that has a live session.
pub struct ConnectionManager {
    catalog: PortCatalog,
    registry: Arc<SessionRegistry>,
    config: TransferConfig,
}

impl ConnectionManager {
    pub fn new(catalog: PortCatalog) -> Self {
        Self::with_config(catalog, TransferConfig::default())
    }

    pub fn with_config(catalog: PortCatalog, config: TransferConfig) -> Self {
        Self {
            catalog,
            registry: Arc::new(SessionRegistry::default()),
            config,
        }
    }

    pub fn catalog(&self) -> &PortCatalog {
        &self.catalog
    }

    /// Open `port` at `baud` and register the session as its exclusive owner.
    ///
    /// Fails with `AlreadyOpen` while another session on the same port is live, still being
    /// opened, or being closed. Never retries a failed open.
    pub async fn open(&self, port: &PortIdentifier, baud: BaudRate) -> Result<Session> {
        let reservation = self.registry.reserve(port)?;

        log::info!("Attempting to open {} at {} baud", port, baud);
        let transport = match self.catalog.backend().open(port, baud).await {
            Ok(transport) => transport,
            Err(e) => {
                log::error!("Failed to open {}: {}", port, e);
                return Err(e);
            }
        };

        let registry = Arc::downgrade(&self.registry);
        let session = Session::start(port.clone(), baud, transport, self.config.clone(), move |id, port, reason| {
            log::warn!("Session {} on {} closed itself: {}", id, port, reason);
            if let Some(registry) = registry.upgrade() {
                registry.release(port, id);
            }
        });

        reservation.commit(session.clone());
        log::info!("Opened session {} on {}", session.id(), port);
        Ok(session)
    }

    /// Close a session and release its port. Closing an already closed session is a no-op.
    pub async fn close(&self, session: &Session) {
        if session.shutdown().await {
            log::info!("Closed session {} on {}", session.id(), session.port());
        } else {
            log::debug!("Session {} on {} was already closed", session.id(), session.port());
        }
        self.registry.release(session.port(), session.id());
    }

    /// Close every live session.
    pub async fn close_all(&self) {
        for session in self.registry.live_sessions() {
            self.close(&session).await;
        }
    }

    /// The live session on `port`, if any.
    pub fn session(&self, port: &PortIdentifier) -> Option<Session> {
        self.registry.live_session(port)
    }

    pub fn is_open(&self, port: &PortIdentifier) -> bool {
        self.registry.live_session(port).is_some()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.registry.live_sessions().iter().map(Session::info).collect();
        sessions.sort_by(|a, b| a.port.cmp(&b.port));
        sessions
    }
}

enum Slot {
    Opening,
    Live(Session),
}

/// Port → session map shared between the manager and the session workers.
#[derive(Default)]
struct SessionRegistry {
    slots: Mutex<HashMap<PortIdentifier, Slot>>,
}

impl SessionRegistry {
    /// Claim `port` for an open in progress.
    fn reserve(&self, port: &PortIdentifier) -> Result<Reservation<'_>> {
        let mut slots = self.lock();
        match slots.get(port) {
            Some(Slot::Opening) => return Err(SerialError::AlreadyOpen(port.clone())),
            // A closing session owns the port until its worker has dropped the device.
            // A transport failure is only published after that drop.
            Some(Slot::Live(session)) if !(session.state().is_failed() || session.is_released()) => {
                return Err(SerialError::AlreadyOpen(port.clone()))
            }
            _ => {}
        }
        slots.insert(port.clone(), Slot::Opening);

        Ok(Reservation {
            registry: self,
            port: port.clone(),
            committed: false,
        })
    }

    /// Drop the entry for `port` if it still belongs to session `id`.
    fn release(&self, port: &PortIdentifier, id: Uuid) {
        let mut slots = self.lock();
        if matches!(slots.get(port), Some(Slot::Live(session)) if session.id() == id) {
            slots.remove(port);
            log::debug!("Released {} from session {}", port, id);
        }
    }

    fn live_session(&self, port: &PortIdentifier) -> Option<Session> {
        match self.lock().get(port) {
            Some(Slot::Live(session)) if session.is_open() => Some(session.clone()),
            _ => None,
        }
    }

    fn live_sessions(&self) -> Vec<Session> {
        self.lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(session) if session.is_open() => Some(session.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PortIdentifier, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Claim on a port while its open is in flight. Dropped without `commit` (failed or
/// cancelled open), it gives the port back.
struct Reservation<'a> {
    registry: &'a SessionRegistry,
    port: PortIdentifier,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, session: Session) {
        self.registry.lock().insert(self.port.clone(), Slot::Live(session));
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut slots = self.registry.lock();
        if matches!(slots.get(&self.port), Some(Slot::Opening)) {
            slots.remove(&self.port);
        }
    }
}
