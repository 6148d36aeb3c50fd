//! Telemetry Subscriber
//!
//! Binds a Ready session's data characteristic to a reading callback.
//! Transport errors and malformed frames are logged and absorbed; the
//! subscription only ends when its handle is cancelled or dropped.

use crate::domain::errors::TelemetryError;
use crate::domain::models::{ImuReading, Session};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::session::SessionManager;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, NotifyCallback, TransportSubscription,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, trace, warn};

/// Counters for one subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub readings_delivered: u64,
    pub transport_errors: u64,
}

#[derive(Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    readings_delivered: AtomicU64,
    transport_errors: AtomicU64,
}

/// Live telemetry subscription. Dropping it cancels.
pub struct SubscriptionHandle {
    peripheral_id: String,
    active: Arc<AtomicBool>,
    counters: Arc<Counters>,
    inner: Mutex<Option<Box<dyn TransportSubscription>>>,
}

impl SubscriptionHandle {
    pub fn peripheral_id(&self) -> &str {
        &self.peripheral_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TelemetryStats {
        TelemetryStats {
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            readings_delivered: self.counters.readings_delivered.load(Ordering::Relaxed),
            transport_errors: self.counters.transport_errors.load(Ordering::Relaxed),
        }
    }

    /// Stop delivering readings. Safe to call repeatedly.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut subscription) = inner {
            subscription.cancel();
            info!("Telemetry subscription for {} cancelled", self.peripheral_id);
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("peripheral_id", &self.peripheral_id)
            .field("active", &self.is_active())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub struct TelemetrySubscriber<T: BleTransport> {
    manager: Arc<SessionManager<T>>,
    raw_data_logging: bool,
}

impl<T: BleTransport> TelemetrySubscriber<T> {
    pub fn new(manager: Arc<SessionManager<T>>) -> Self {
        Self {
            manager,
            raw_data_logging: false,
        }
    }

    /// Trace every raw frame as hex
    pub fn with_raw_data_logging(mut self, enabled: bool) -> Self {
        self.raw_data_logging = enabled;
        self
    }

    /// Start streaming decoded readings from `session` into `on_reading`,
    /// five per frame, in frame order.
    pub async fn subscribe<F>(
        &self,
        session: &Session,
        on_reading: F,
    ) -> Result<SubscriptionHandle, TelemetryError>
    where
        F: Fn(ImuReading) + Send + Sync + 'static,
    {
        let peer = self
            .manager
            .ready_peer(&session.peripheral_id)
            .ok_or_else(|| TelemetryError::NotReady(session.peripheral_id.clone()))?;

        let active = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        let callback: NotifyCallback = {
            let active = active.clone();
            let counters = counters.clone();
            let peripheral_id = session.peripheral_id.clone();
            let raw_data_logging = self.raw_data_logging;

            Arc::new(move |notification| {
                if !active.load(Ordering::SeqCst) {
                    return;
                }

                let payload = match notification {
                    Ok(Some(payload)) => payload,
                    Ok(None) => return,
                    Err(e) => {
                        counters.transport_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("Telemetry error from {}: {}", peripheral_id, e);
                        return;
                    }
                };

                counters.frames_received.fetch_add(1, Ordering::Relaxed);
                if raw_data_logging {
                    trace!("Raw frame from {}: {}", peripheral_id, protocol::hex_dump(&payload));
                }

                match protocol::decode_telemetry_frame(&payload) {
                    Ok(readings) => {
                        debug!(
                            "Received {} IMU readings from {}",
                            readings.len(),
                            peripheral_id
                        );
                        for reading in readings {
                            // Cancellation may land mid-frame
                            if !active.load(Ordering::SeqCst) {
                                return;
                            }
                            on_reading(reading);
                            counters.readings_delivered.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e) => {
                        counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("Dropping frame from {}: {}", peripheral_id, e);
                    }
                }
            })
        };

        let subscription = self
            .manager
            .transport()
            .monitor(
                &peer,
                &session.service_id,
                &session.characteristic_id,
                callback,
            )
            .await
            .map_err(TelemetryError::MonitorFailed)?;

        info!("Subscribed to telemetry from {}", session.peripheral_id);

        Ok(SubscriptionHandle {
            peripheral_id: session.peripheral_id.clone(),
            active,
            counters,
            inner: Mutex::new(Some(subscription)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::TransportError;
    use crate::domain::models::{PeripheralHandle, SessionState, Side, Vec3};
    use crate::infrastructure::bluetooth::mock::MockTransport;
    use crate::infrastructure::bluetooth::session::SessionConfig;

    fn frame(first_timestamp: u32) -> Vec<u8> {
        let readings = [0, 1, 2, 3, 4].map(|i| ImuReading {
            timestamp_ms: first_timestamp + i,
            accel: Vec3::new(0.0, 0.0, 1.0),
            ..Default::default()
        });
        protocol::encode_telemetry_frame(&readings).to_vec()
    }

    async fn ready_session() -> (
        Arc<MockTransport>,
        TelemetrySubscriber<MockTransport>,
        Session,
    ) {
        let transport = Arc::new(MockTransport::with_devices(vec![PeripheralHandle::new(
            "r",
            Some("ESP32"),
        )]));
        let manager = Arc::new(SessionManager::new(
            transport.clone(),
            SessionConfig::default(),
        ));
        let session = manager
            .connect(&PeripheralHandle::new("r", Some("ESP32")), Side::Right)
            .await
            .unwrap();
        (transport, TelemetrySubscriber::new(manager), session)
    }

    fn collector() -> (Arc<Mutex<Vec<ImuReading>>>, impl Fn(ImuReading) + Send + Sync) {
        let readings = Arc::new(Mutex::new(Vec::new()));
        let sink = readings.clone();
        (readings, move |r| sink.lock().unwrap().push(r))
    }

    #[tokio::test]
    async fn test_delivers_readings_in_frame_order() {
        let (transport, subscriber, session) = ready_session().await;
        let (readings, on_reading) = collector();

        let handle = subscriber.subscribe(&session, on_reading).await.unwrap();
        assert_eq!(transport.notify("r", Ok(Some(frame(100)))), 1);
        assert_eq!(transport.notify("r", Ok(Some(frame(200)))), 1);

        let timestamps: Vec<u32> = readings.lock().unwrap().iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(timestamps, vec![100, 101, 102, 103, 104, 200, 201, 202, 203, 204]);
        assert_eq!(handle.stats().frames_received, 2);
        assert_eq!(handle.stats().readings_delivered, 10);
    }

    #[tokio::test]
    async fn test_errors_and_bad_frames_are_absorbed() {
        let (transport, subscriber, session) = ready_session().await;
        let (readings, on_reading) = collector();

        let handle = subscriber.subscribe(&session, on_reading).await.unwrap();
        transport.notify("r", Err(TransportError::Other("link lost".to_string())));
        transport.notify("r", Ok(Some(vec![0u8; 219])));
        transport.notify("r", Ok(None));
        transport.notify("r", Ok(Some(frame(7))));

        assert_eq!(readings.lock().unwrap().len(), 5);
        assert!(handle.is_active());
        assert_eq!(
            handle.stats(),
            TelemetryStats {
                frames_received: 2,
                frames_dropped: 1,
                readings_delivered: 5,
                transport_errors: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery() {
        let (transport, subscriber, session) = ready_session().await;
        let (readings, on_reading) = collector();

        let handle = subscriber.subscribe(&session, on_reading).await.unwrap();
        transport.notify("r", Ok(Some(frame(0))));
        handle.cancel();
        handle.cancel();
        assert!(!handle.is_active());
        assert_eq!(transport.monitor_count("r"), 0);
        assert_eq!(transport.notify("r", Ok(Some(frame(10)))), 0);
        assert_eq!(readings.lock().unwrap().len(), 5);

        let second = subscriber.subscribe(&session, |_| {}).await.unwrap();
        assert_eq!(transport.monitor_count("r"), 1);
        drop(second);
        assert_eq!(transport.monitor_count("r"), 0);
    }

    #[tokio::test]
    async fn test_requires_ready_session() {
        let (transport, subscriber, session) = ready_session().await;

        let unknown = Session {
            peripheral_id: "nope".to_string(),
            state: SessionState::Ready,
            ..session.clone()
        };
        let err = subscriber.subscribe(&unknown, |_| {}).await.unwrap_err();
        assert_eq!(err, TelemetryError::NotReady("nope".to_string()));

        transport.fail_monitor(Some(TransportError::SubscriptionFailed("cccd".to_string())));
        let err = subscriber.subscribe(&session, |_| {}).await.unwrap_err();
        assert!(matches!(err, TelemetryError::MonitorFailed(_)));
    }

    #[tokio::test]
    async fn test_rejects_session_still_connecting() {
        let transport = Arc::new(MockTransport::with_devices(vec![PeripheralHandle::new(
            "l",
            Some("ESP32"),
        )]));
        let manager = Arc::new(SessionManager::new(
            transport.clone(),
            SessionConfig::default(),
        ));
        let subscriber = TelemetrySubscriber::new(manager.clone());
        let gate = transport.gate_connect("l");
        let handle = PeripheralHandle::new("l", Some("ESP32"));

        let (connected, early) = tokio::join!(manager.connect(&handle, Side::Left), async {
            tokio::task::yield_now().await;
            let pending = manager.sessions().remove(0);
            assert_eq!(pending.state, SessionState::Connecting);
            let result = subscriber.subscribe(&pending, |_| {}).await;
            gate.notify_one();
            result
        });

        assert_eq!(early.unwrap_err(), TelemetryError::NotReady("l".to_string()));
        assert_eq!(transport.monitor_count("l"), 0);

        let session = connected.unwrap();
        let handle = subscriber.subscribe(&session, |_| {}).await.unwrap();
        assert!(handle.is_active());
        assert!(format!("{:?}", handle).contains("peripheral_id: \"l\""));
    }

    #[test]
    fn test_debug_omits_transport_subscription() {
        let handle = SubscriptionHandle {
            peripheral_id: "r".to_string(),
            active: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            inner: Mutex::new(None),
        };
        let text = format!("{:?}", handle);
        assert!(text.starts_with("SubscriptionHandle"));
        assert!(text.contains("active: false"));
        assert!(!text.contains("inner"));
    }
}
