//! MIYA HRV device facade

use std::sync::{Arc, Mutex, RwLock};

use miya_protocol::commands::names;
use miya_protocol::frame::STANDARD_FRAME_LEN;
use miya_protocol::{
    decode_frame, encode_hex, interpret, CommandTable, ConnectionInfo, ControlFrame,
    FieldChange, FrameView, ReceivedFrame, StatusSnapshot, SubscriberError, SubscriberRegistry,
    SubscriptionId, TcpTransport, TransportEvent,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::DeviceConfig;
use crate::error::DeviceError;

/// Device events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// A valid status frame for this device was decoded
    StatusUpdated { status: StatusSnapshot },
    /// Fields that differ from the previous status report
    StatusChanged { changes: Vec<FieldChange> },
    /// The controller answered an address query
    AddressReported { address: u8 },
    /// Transport connection event
    Connection { event: TransportEvent },
}

/// Shared state touched from the transport's read loop
struct FrameHandler {
    address: u8,
    status: RwLock<Option<StatusSnapshot>>,
    listeners: SubscriberRegistry<StatusSnapshot>,
    event_tx: broadcast::Sender<DeviceEvent>,
}

impl FrameHandler {
    fn handle(&self, frame: &ReceivedFrame) -> Result<(), SubscriberError> {
        let view = decode_frame(frame.bytes());
        match &view {
            FrameView::Standard(standard) => {
                if !standard.crc_valid() {
                    tracing::warn!(
                        "Dropping frame with bad CRC (got {:04X}, expected {:04X}): {}",
                        standard.crc(),
                        standard.expected_crc(),
                        frame.hex()
                    );
                    return Ok(());
                }
                if standard.address() != self.address || !standard.address_consistent() {
                    tracing::debug!(
                        "Ignoring frame for address {:#04x}/{:#04x}",
                        standard.address(),
                        standard.address_repeat()
                    );
                    return Ok(());
                }

                match interpret(&view) {
                    Ok(status) => self.update(status),
                    Err(unsupported) => tracing::debug!("Skipping frame: {}", unsupported),
                }
            }
            FrameView::AddressResponse { address } => {
                tracing::info!("Controller reported bus address {:#04x}", address);
                let _ = self.event_tx.send(DeviceEvent::AddressReported { address: *address });
            }
            FrameView::AddressQuery { parameter } => {
                tracing::debug!("Address query on bus (parameter {:#04x})", parameter);
            }
            FrameView::Unrecognized { reason } => {
                tracing::warn!("Unrecognized frame ({}): {}", reason, frame.hex());
            }
        }
        Ok(())
    }

    fn update(&self, status: StatusSnapshot) {
        let previous = {
            let mut current = self.status.write().unwrap_or_else(|e| e.into_inner());
            current.replace(status)
        };
        let changes = match previous {
            Some(previous) => status.changes_since(&previous),
            None => {
                tracing::info!("Device {:#04x} status: {:?}", self.address, status.to_map());
                Vec::new()
            }
        };
        for change in &changes {
            tracing::info!(
                "Device {:#04x} {}: {} -> {}",
                self.address,
                change.field,
                change.previous,
                change.current
            );
        }

        self.listeners.notify(&status);
        let _ = self.event_tx.send(DeviceEvent::StatusUpdated { status });
        if !changes.is_empty() {
            let _ = self.event_tx.send(DeviceEvent::StatusChanged { changes });
        }
    }
}

/// Spots the `Connected` event that completes an automatic reconnect
#[derive(Debug, Default)]
struct ReconnectTracker {
    reconnecting: bool,
}

impl ReconnectTracker {
    /// Returns `true` when `event` ends a reconnect cycle with a connection
    fn observe(&mut self, event: &TransportEvent) -> bool {
        match event {
            TransportEvent::ReconnectAttempt { .. } => {
                self.reconnecting = true;
                false
            }
            TransportEvent::Connected => std::mem::take(&mut self.reconnecting),
            // A lost connection precedes its reconnect attempts, so this
            // only clears a cycle cut short by an explicit disconnect
            TransportEvent::Disconnected { .. } | TransportEvent::ReconnectFailed { .. } => {
                self.reconnecting = false;
                false
            }
            _ => false,
        }
    }
}

/// One MIYA HRV unit on an RS-485 bus behind a TCP bridge
///
/// Owns the transport and the command table resolved for its bus address,
/// and keeps the most recent status reported by the controller.
pub struct MiyaDevice {
    config: DeviceConfig,
    transport: TcpTransport,
    commands: CommandTable,
    handler: Arc<FrameHandler>,
    frame_subscription: SubscriptionId,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl MiyaDevice {
    pub fn new(config: DeviceConfig) -> Result<Self, DeviceError> {
        config.validate()?;
        let commands = CommandTable::resolve_all(config.address)?;
        let transport = TcpTransport::new(config.transport_config());

        let (event_tx, _) = broadcast::channel(64);
        let handler = Arc::new(FrameHandler {
            address: config.address,
            status: RwLock::new(None),
            listeners: SubscriberRegistry::new("status"),
            event_tx,
        });

        let frame_subscription = {
            let handler = handler.clone();
            transport.subscribe(move |frame| handler.handle(frame))
        };

        tracing::info!(
            "Configured MIYA device {:#04x} at {}",
            config.address,
            transport.config().addr()
        );

        Ok(Self {
            config,
            transport,
            commands,
            handler,
            frame_subscription,
            watcher: Mutex::new(None),
        })
    }

    /// Connect to the bridge and, if configured, ask for the current status
    pub async fn connect(&self) -> Result<(), DeviceError> {
        self.start_watcher();
        self.transport.connect().await?;
        if self.config.query_on_connect {
            self.refresh().await?;
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// Send a named command from the resolved table
    pub async fn send_command(&self, name: &str) -> Result<(), DeviceError> {
        let frame = self
            .commands
            .get(name)
            .ok_or_else(|| DeviceError::UnknownCommand(name.to_string()))?;
        tracing::info!("Sending {} to device {:#04x}", name, self.config.address);
        self.transport.send(frame).await?;
        Ok(())
    }

    /// Send one control frame setting every field present in `control`
    pub async fn send_control(&self, control: &ControlFrame) -> Result<(), DeviceError> {
        let frame = control.resolve(self.config.address)?;
        tracing::info!(
            "Sending control frame to device {:#04x}: {}",
            self.config.address,
            encode_hex(&frame)
        );
        self.transport.send(&frame).await?;
        Ok(())
    }

    /// Request a status report; the answer arrives asynchronously
    pub async fn refresh(&self) -> Result<(), DeviceError> {
        self.send_command(names::STATUS_QUERY).await
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    /// Most recent valid status, if any has been received
    pub fn current_status(&self) -> Option<StatusSnapshot> {
        *self
            .handler
            .status
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Register a callback run on every status update
    pub fn add_listener<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StatusSnapshot) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.handler.listeners.subscribe(callback)
    }

    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        self.handler.listeners.unsubscribe(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.handler.event_tx.subscribe()
    }

    pub fn transport(&self) -> &TcpTransport {
        &self.transport
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn address(&self) -> u8 {
        self.config.address
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.transport.connection_info()
    }

    /// Forward transport events and re-query status after reconnects
    fn start_watcher(&self) {
        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if watcher.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let mut events = self.transport.events();
        let transport = self.transport.clone();
        let event_tx = self.handler.event_tx.clone();
        let query = self.query_frame();
        let mut tracker = ReconnectTracker::default();

        *watcher = Some(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Device watcher lagged, skipped {} events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                if tracker.observe(&event) {
                    if let Some(query) = query {
                        tracing::debug!("Re-querying status after reconnect");
                        if let Err(e) = transport.send(&query).await {
                            tracing::warn!("Status query after reconnect failed: {}", e);
                        }
                    }
                }

                let _ = event_tx.send(DeviceEvent::Connection { event });
            }
        }));
    }

    fn query_frame(&self) -> Option<[u8; STANDARD_FRAME_LEN]> {
        if !self.config.query_on_connect {
            return None;
        }
        self.commands.get(names::STATUS_QUERY).copied()
    }
}

impl Drop for MiyaDevice {
    fn drop(&mut self) {
        self.transport.unsubscribe(self.frame_subscription);
        if let Some(handle) = self
            .watcher
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use miya_protocol::{decode_hex, encode_hex, resolve_command, FanMode, PowerMode, Toggle};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const QUERY_ADDR_1: &str = "C7 12 01 01 01 00 00 00 00 00 00 00 00 00 00 00 00 00 AE 29";
    const STATUS_ADDR_1: &str = "C7 12 01 01 01 02 03 03 01 01 01 01 01 01 01 01 00 00 8C 2B";

    async fn setup(query_on_connect: bool) -> (MiyaDevice, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = DeviceConfig::new("127.0.0.1");
        config.port = listener.local_addr().unwrap().port();
        config.keepalive = false;
        config.connect_timeout_secs = 2;
        config.reconnect_backoff_step_secs = 1;
        config.query_on_connect = query_on_connect;
        (MiyaDevice::new(config).unwrap(), listener)
    }

    async fn read_frame(peer: &mut TcpStream) -> String {
        let mut buf = [0u8; 20];
        tokio::time::timeout(Duration::from_secs(5), peer.read_exact(&mut buf))
            .await
            .expect("no frame from device")
            .unwrap();
        encode_hex(&buf)
    }

    async fn next_status(events: &mut broadcast::Receiver<DeviceEvent>) -> StatusSnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let DeviceEvent::StatusUpdated { status } = events.recv().await.unwrap() {
                    return status;
                }
            }
        })
        .await
        .expect("no status update")
    }

    /// Valid status frame for `address` with the given data bytes set
    fn status_frame(address: u8, fields: &[(usize, u8)]) -> [u8; 20] {
        let mut template = [0u8; 18];
        template[0] = 0xC7;
        template[1] = 0x12;
        template[3] = 0x01;
        for &(at, value) in fields {
            template[at] = value;
        }
        resolve_command(&template, address).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = MiyaDevice::new(DeviceConfig::default());
        assert!(matches!(result, Err(DeviceError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_sends_status_query() {
        let (device, listener) = setup(true).await;
        device.connect().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        assert_eq!(read_frame(&mut peer).await, QUERY_ADDR_1);
        assert!(device.is_connected());
        device.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_command() {
        let (device, listener) = setup(false).await;
        device.connect().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        device.send_command("power_off").await.unwrap();
        assert_eq!(
            read_frame(&mut peer).await,
            "C7 12 01 02 01 01 00 00 00 00 00 00 00 00 00 00 00 00 08 6F"
        );

        let err = device.send_command("turbo").await.unwrap_err();
        assert!(matches!(err, DeviceError::UnknownCommand(ref name) if name == "turbo"));
        device.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_control() {
        let (device, listener) = setup(false).await;
        device.connect().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        let control = ControlFrame {
            power: Some(false),
            timer: Some(true),
            ..ControlFrame::default()
        };
        device.send_control(&control).await.unwrap();
        assert_eq!(
            read_frame(&mut peer).await,
            encode_hex(&control.resolve(0x01).unwrap())
        );

        let too_fast = ControlFrame {
            fan_speed: Some(0x09),
            ..ControlFrame::default()
        };
        let err = device.send_control(&too_fast).await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Protocol(miya_protocol::ProtocolError::Validation(_))
        ));
        device.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        let (device, _listener) = setup(false).await;
        let err = device.refresh().await.unwrap_err();
        assert!(err.is_not_connected());
    }

    #[tokio::test]
    async fn test_status_updates_cache_and_listeners() {
        let (device, listener) = setup(false).await;
        let mut events = device.subscribe();
        let calls = Arc::new(AtomicUsize::new(0));
        device.add_listener(|_| panic!("faulty listener"));
        let id = {
            let calls = calls.clone();
            device.add_listener(move |status| {
                assert_eq!(status.mode, PowerMode::Auto);
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        device.connect().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        assert!(device.current_status().is_none());

        peer.write_all(&decode_hex(STATUS_ADDR_1).unwrap())
            .await
            .unwrap();
        let status = next_status(&mut events).await;
        assert_eq!(status.mode, PowerMode::Auto);
        assert_eq!(status.fan_mode, FanMode::Level3);
        assert_eq!(status.negative_ion, Toggle::Off);
        assert_eq!(device.current_status(), Some(status));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(device.remove_listener(id));
        peer.write_all(&decode_hex(STATUS_ADDR_1).unwrap())
            .await
            .unwrap();
        next_status(&mut events).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        device.disconnect().await;
    }

    #[tokio::test]
    async fn test_status_changes_reported() {
        let (device, listener) = setup(false).await;
        let mut events = device.subscribe();
        device.connect().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        let first = decode_hex(STATUS_ADDR_1).unwrap();
        peer.write_all(&first).await.unwrap();
        next_status(&mut events).await;
        peer.write_all(&first).await.unwrap();
        next_status(&mut events).await;

        let mut bypass_on = [0u8; 18];
        bypass_on.copy_from_slice(&first[..18]);
        bypass_on[14] = 0x02;
        peer.write_all(&resolve_command(&bypass_on, 0x01).unwrap())
            .await
            .unwrap();

        let changes = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let DeviceEvent::StatusChanged { changes } = events.recv().await.unwrap() {
                    return changes;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(
            changes,
            vec![FieldChange {
                field: "bypass",
                previous: "off",
                current: "on",
            }]
        );
        assert_eq!(device.current_status().unwrap().bypass, Toggle::On);

        device.disconnect().await;
    }

    #[tokio::test]
    async fn test_invalid_and_foreign_frames_are_dropped() {
        let (device, listener) = setup(false).await;
        let mut events = device.subscribe();
        device.connect().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        // Bad CRC, then a valid frame for another unit, then ours
        let bad_crc =
            decode_hex("C7 12 01 01 01 02 03 03 01 01 01 01 01 01 01 01 00 00 AD DD").unwrap();
        peer.write_all(&bad_crc).await.unwrap();
        peer.write_all(&status_frame(0x02, &[(5, 0x01)])).await.unwrap();
        peer.write_all(&status_frame(0x01, &[(5, 0x02), (10, 0x02)]))
            .await
            .unwrap();

        let status = next_status(&mut events).await;
        assert_eq!(status.mode, PowerMode::Manual);
        assert_eq!(device.current_status().unwrap().mode, PowerMode::Manual);
        assert_eq!(device.transport().stats().frames_received, 3);

        device.disconnect().await;
    }

    #[tokio::test]
    async fn test_address_response_event() {
        let (device, listener) = setup(false).await;
        let mut events = device.subscribe();
        device.connect().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        peer.write_all(&[0xAA, 0x07, 0x00, 0x01, 0x00, 0x00, 0x00])
            .await
            .unwrap();
        let address = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let DeviceEvent::AddressReported { address } = events.recv().await.unwrap() {
                    return address;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(address, 0x01);
        assert!(device.current_status().is_none());

        device.disconnect().await;
    }

    #[tokio::test]
    async fn test_requery_after_reconnect() {
        let (device, listener) = setup(true).await;
        let mut events = device.subscribe();
        device.connect().await.unwrap();

        let (mut peer, _) = listener.accept().await.unwrap();
        assert_eq!(read_frame(&mut peer).await, QUERY_ADDR_1);
        drop(peer);

        // The bridge is still listening, so the first reconnect attempt succeeds
        let (mut peer, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read_frame(&mut peer).await, QUERY_ADDR_1);

        let mut saw_reconnect = false;
        while let Ok(event) = events.try_recv() {
            if let DeviceEvent::Connection {
                event: TransportEvent::ReconnectAttempt { .. },
            } = event
            {
                saw_reconnect = true;
            }
        }
        assert!(saw_reconnect);

        device.disconnect().await;
    }

    #[tokio::test]
    async fn test_single_query_after_disconnect_during_reconnect() {
        let (device, listener) = setup(true).await;
        let port = listener.local_addr().unwrap().port();
        let mut events = device.subscribe();
        device.connect().await.unwrap();

        let (mut peer, _) = listener.accept().await.unwrap();
        assert_eq!(read_frame(&mut peer).await, QUERY_ADDR_1);
        drop(listener);
        drop(peer);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let DeviceEvent::Connection {
                    event: TransportEvent::ReconnectAttemptFailed { .. },
                } = events.recv().await.unwrap()
                {
                    return;
                }
            }
        })
        .await
        .unwrap();
        device.disconnect().await;

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        device.connect().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        assert_eq!(read_frame(&mut peer).await, QUERY_ADDR_1);

        let mut extra = [0u8; 20];
        let second = tokio::time::timeout(Duration::from_millis(300), peer.read_exact(&mut extra));
        assert!(second.await.is_err());

        device.disconnect().await;
    }

    #[test]
    fn test_reconnect_tracker() {
        let attempt = TransportEvent::ReconnectAttempt {
            attempt: 1,
            max_attempts: 5,
        };
        let lost = TransportEvent::Disconnected {
            reason: "connection closed by peer".to_string(),
        };

        let mut tracker = ReconnectTracker::default();
        assert!(!tracker.observe(&TransportEvent::Connected));
        assert!(!tracker.observe(&lost));
        assert!(!tracker.observe(&attempt));
        assert!(tracker.observe(&TransportEvent::Connected));
        assert!(!tracker.observe(&TransportEvent::Connected));

        // Explicit disconnect in the middle of a reconnect cycle
        assert!(!tracker.observe(&attempt));
        assert!(!tracker.observe(&TransportEvent::Disconnected {
            reason: "disconnect requested".to_string(),
        }));
        assert!(!tracker.observe(&TransportEvent::Connected));

        assert!(!tracker.observe(&attempt));
        assert!(!tracker.observe(&TransportEvent::ReconnectFailed { attempts: 5 }));
        assert!(!tracker.observe(&TransportEvent::Connected));
    }

    #[tokio::test]
    async fn test_commands_resolved_for_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = DeviceConfig::new("127.0.0.1");
        config.port = listener.local_addr().unwrap().port();
        config.address = 0x02;
        let device = MiyaDevice::new(config).unwrap();

        assert_eq!(device.address(), 0x02);
        assert_eq!(device.commands().address(), 0x02);
        assert!(device.commands().names().any(|n| n == "bypass_on"));
        let query = device.commands().get("status_query").unwrap();
        assert_eq!(
            encode_hex(query),
            "C7 12 02 01 02 00 00 00 00 00 00 00 00 00 00 00 00 00 CB C7"
        );
    }
}
