//! Sync Dispatcher
//!
//! Writes the current wall-clock time to a sensor so its sample timestamps
//! can be aligned with the host. Failures are reported, never retried.

use crate::domain::errors::SyncError;
use crate::domain::models::{AppEvent, Session, Side};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::session::SessionManager;
use crate::infrastructure::bluetooth::transport::BleTransport;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Milliseconds since the UNIX epoch
pub fn system_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct SyncDispatcher<T: BleTransport> {
    manager: Arc<SessionManager<T>>,
    clock: fn() -> u64,
    event_sender: Option<mpsc::UnboundedSender<AppEvent>>,
}

impl<T: BleTransport> SyncDispatcher<T> {
    pub fn new(manager: Arc<SessionManager<T>>) -> Self {
        Self {
            manager,
            clock: system_time_ms,
            event_sender: None,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    /// Write a sync packet to `session`, which must be Ready
    pub async fn send_sync(&self, session: Option<&Session>) -> Result<(), SyncError> {
        let session = session.ok_or(SyncError::NoSession)?;
        let peer = self
            .manager
            .ready_peer(&session.peripheral_id)
            .ok_or(SyncError::NoSession)?;

        let timestamp_ms = (self.clock)();
        let packet = protocol::encode_sync_packet(timestamp_ms);
        info!("Sending sync timestamp {} to {}", timestamp_ms, session.peripheral_id);
        debug!("Sync payload: {}", protocol::payload_base64(&packet));

        if let Err(e) = self
            .manager
            .transport()
            .write_with_response(
                &peer,
                &session.service_id,
                &session.characteristic_id,
                &packet,
            )
            .await
        {
            error!("Failed to sync {}: {}", session.peripheral_id, e);
            return Err(SyncError::WriteFailed(e));
        }

        if let Some(sender) = &self.event_sender {
            let _ = sender.send(AppEvent::SyncSent {
                peripheral_id: session.peripheral_id.clone(),
                timestamp_ms: u32::from_le_bytes(packet),
            });
        }
        Ok(())
    }

    /// Sync whichever Ready session sits on `side`
    pub async fn send_sync_to_side(&self, side: Side) -> Result<(), SyncError> {
        let session = self.manager.session_for_side(side);
        self.send_sync(session.as_ref()).await
    }

    /// Sync the earliest connected Ready session
    pub async fn send_sync_to_first(&self) -> Result<(), SyncError> {
        let session = self.manager.ready_sessions().into_iter().next();
        self.send_sync(session.as_ref()).await
    }

    /// Sync on a fixed interval until the task is aborted. `None` targets
    /// the first Ready session.
    pub fn spawn_periodic(self: Arc<Self>, side: Option<Side>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let result = match side {
                    Some(side) => self.send_sync_to_side(side).await,
                    None => self.send_sync_to_first().await,
                };
                match result {
                    Ok(()) => {}
                    Err(SyncError::NoSession) => debug!("Periodic sync skipped: no ready session"),
                    Err(e) => warn!("Periodic sync failed: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::TransportError;
    use crate::domain::models::PeripheralHandle;
    use crate::infrastructure::bluetooth::mock::{MockCall, MockTransport};
    use crate::infrastructure::bluetooth::session::SessionConfig;

    fn fixed_clock() -> u64 {
        4_294_967_296 + 1000
    }

    async fn setup() -> (
        Arc<MockTransport>,
        Arc<SessionManager<MockTransport>>,
        SyncDispatcher<MockTransport>,
    ) {
        let transport = Arc::new(MockTransport::with_devices(vec![
            PeripheralHandle::new("l", Some("ESP32-L")),
            PeripheralHandle::new("r", Some("ESP32-R")),
        ]));
        let manager = Arc::new(SessionManager::new(
            transport.clone(),
            SessionConfig::default(),
        ));
        let dispatcher = SyncDispatcher::new(manager.clone()).with_clock(fixed_clock);
        (transport, manager, dispatcher)
    }

    #[tokio::test]
    async fn test_writes_truncated_timestamp() {
        let (transport, manager, dispatcher) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = dispatcher.with_events(tx);
        let session = manager
            .connect(&PeripheralHandle::new("r", Some("ESP32-R")), Side::Right)
            .await
            .unwrap();

        dispatcher.send_sync(Some(&session)).await.unwrap();

        assert_eq!(transport.writes("r"), vec![vec![0xE8, 0x03, 0x00, 0x00]]);
        assert!(transport.calls().contains(&MockCall::Write {
            peripheral_id: "r".to_string(),
            service_id: session.service_id.clone(),
            characteristic_id: session.characteristic_id.clone(),
            payload: protocol::encode_sync_packet(1000).to_vec(),
        }));
        assert!(matches!(
            rx.try_recv(),
            Ok(AppEvent::SyncSent { timestamp_ms: 1000, .. })
        ));
    }

    #[tokio::test]
    async fn test_no_session() {
        let (_transport, manager, dispatcher) = setup().await;
        assert_eq!(dispatcher.send_sync(None).await, Err(SyncError::NoSession));
        assert_eq!(
            dispatcher.send_sync_to_side(Side::Left).await,
            Err(SyncError::NoSession)
        );
        assert_eq!(dispatcher.send_sync_to_first().await, Err(SyncError::NoSession));

        // A session snapshot that has since been closed is no longer valid
        let session = manager
            .connect(&PeripheralHandle::new("l", Some("ESP32-L")), Side::Left)
            .await
            .unwrap();
        manager.disconnect(Some("l"));
        assert_eq!(
            dispatcher.send_sync(Some(&session)).await,
            Err(SyncError::NoSession)
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_reported_once() {
        let (transport, manager, dispatcher) = setup().await;
        manager
            .connect(&PeripheralHandle::new("l", Some("ESP32-L")), Side::Left)
            .await
            .unwrap();
        transport.fail_writes(Some(TransportError::WriteFailed("unreachable".to_string())));

        let err = dispatcher.send_sync_to_side(Side::Left).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::WriteFailed(TransportError::WriteFailed("unreachable".to_string()))
        );
        // One attempt, no retry
        assert_eq!(transport.writes("l"), vec![protocol::encode_sync_packet(1000).to_vec()]);
    }

    #[tokio::test]
    async fn test_side_and_first_selection() {
        let (transport, manager, dispatcher) = setup().await;
        manager
            .connect(&PeripheralHandle::new("r", Some("ESP32-R")), Side::Right)
            .await
            .unwrap();
        manager
            .connect(&PeripheralHandle::new("l", Some("ESP32-L")), Side::Left)
            .await
            .unwrap();

        dispatcher.send_sync_to_first().await.unwrap();
        dispatcher.send_sync_to_side(Side::Left).await.unwrap();
        assert_eq!(transport.writes("r").len(), 1);
        assert_eq!(transport.writes("l").len(), 1);
    }
}
