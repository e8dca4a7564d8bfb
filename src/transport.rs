//! The wireless transport seam: what a session needs from a device link,
//! with the btleplug-backed implementation behind it.
//!
//! Every operation takes an explicit timeout. A timeout is an ordinary
//! `TransportError`, so a stalled device drives its session into backoff
//! instead of wedging a connection slot.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central as BtCentral, Characteristic, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt as _;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

const NOTIFY_BUFFER: usize = 32;
const UNSUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("characteristic {0} not present on device")]
    MissingCharacteristic(Uuid),
    #[error("device link lost")]
    LinkLost,
    #[error(transparent)]
    Ble(#[from] btleplug::Error),
}

/// One connectable device, as a session sees it.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Physical address, upper-case colon-separated hex.
    fn id(&self) -> String;
    fn name(&self) -> Option<String>;
    async fn connect(&self, timeout: Duration) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
    async fn is_connected(&self) -> bool;
    async fn read(
        &self,
        characteristic: Uuid,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;
    async fn write(
        &self,
        characteristic: Uuid,
        payload: &[u8],
        ack: bool,
        timeout: Duration,
    ) -> Result<(), TransportError>;
    /// Subscribe to notifications. The returned channel closes when the
    /// underlying stream ends; dropping it or calling [`unsubscribe`]
    /// tears the subscription down.
    ///
    /// [`unsubscribe`]: NodeTransport::unsubscribe
    async fn subscribe(
        &self,
        characteristic: Uuid,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError>;
}

/// Discovery capability of the local adapter.
#[async_trait]
pub trait Central: Send + Sync {
    type Node: NodeTransport + 'static;
    async fn discover(&self, timeout: Duration) -> Result<Vec<Self::Node>, TransportError>;
}

async fn deadline<T, F>(limit: Duration, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, btleplug::Error>> + Send,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(TransportError::from),
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}

pub struct BtleNode {
    peripheral: Peripheral,
    name: Option<String>,
    forwarders: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl BtleNode {
    fn new(peripheral: Peripheral, name: Option<String>) -> Self {
        BtleNode {
            peripheral,
            name,
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::MissingCharacteristic(uuid))
    }
}

#[async_trait]
impl NodeTransport for BtleNode {
    fn id(&self) -> String {
        self.peripheral.address().to_string()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn connect(&self, timeout: Duration) -> Result<(), TransportError> {
        deadline(timeout, self.peripheral.connect()).await?;
        // Characteristic lookup needs the service table populated.
        deadline(timeout, self.peripheral.discover_services()).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut forwarders = self.forwarders.lock().await;
        for (_, task) in forwarders.drain() {
            task.abort();
        }
        drop(forwarders);
        deadline(UNSUBSCRIBE_TIMEOUT, self.peripheral.disconnect()).await
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn read(
        &self,
        characteristic: Uuid,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let c = self.characteristic(characteristic)?;
        deadline(timeout, self.peripheral.read(&c)).await
    }

    async fn write(
        &self,
        characteristic: Uuid,
        payload: &[u8],
        ack: bool,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let c = self.characteristic(characteristic)?;
        let write_type = if ack {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        deadline(timeout, self.peripheral.write(&c, payload, write_type)).await
    }

    async fn subscribe(
        &self,
        characteristic: Uuid,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let c = self.characteristic(characteristic)?;
        deadline(timeout, self.peripheral.subscribe(&c)).await?;
        let mut notifications = deadline(timeout, self.peripheral.notifications()).await?;

        let (tx, rx) = mpsc::channel(NOTIFY_BUFFER);
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    // Receiver gone; the subscriber is shutting down.
                    break;
                }
            }
            debug!("notification stream for {characteristic} ended");
        });
        if let Some(stale) = self
            .forwarders
            .lock()
            .await
            .insert(characteristic, forwarder)
        {
            stale.abort();
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        if let Some(task) = self.forwarders.lock().await.remove(&characteristic) {
            task.abort();
        }
        let c = self.characteristic(characteristic)?;
        deadline(UNSUBSCRIBE_TIMEOUT, self.peripheral.unsubscribe(&c)).await
    }
}

pub struct BtleCentral {
    adapter: Adapter,
}

impl BtleCentral {
    pub fn new(adapter: Adapter) -> Self {
        BtleCentral { adapter }
    }
}

#[async_trait]
impl Central for BtleCentral {
    type Node = BtleNode;

    /// Scan for the given window, then report everything the adapter saw.
    async fn discover(&self, timeout: Duration) -> Result<Vec<BtleNode>, TransportError> {
        let filter = ScanFilter {
            services: vec![crate::codec::uuids::NETWORK_NODE_SERVICE],
        };
        self.adapter.start_scan(filter).await?;
        tokio::time::sleep(timeout).await;
        if let Err(err) = self.adapter.stop_scan().await {
            warn!("stopping scan failed: {err}");
        }

        let mut nodes = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let name = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|p| p.local_name);
            nodes.push(BtleNode::new(peripheral, name));
        }
        Ok(nodes)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable in-memory transport used by session, scheduler and
    //! dispatcher tests.

    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

    use super::*;

    /// Tracks how many connections are open at once across mock nodes.
    #[derive(Default)]
    pub struct ConnectionGauge {
        pub current: AtomicUsize,
        pub peak: AtomicUsize,
    }

    impl ConnectionGauge {
        fn opened(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn closed(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub struct MockState {
        /// Fail this many connect attempts before succeeding.
        pub connect_failures: AtomicU32,
        /// Held inside connect so concurrency tests actually overlap.
        pub connect_delay_ms: AtomicU32,
        pub fail_reads: AtomicBool,
        pub connected: AtomicBool,
        pub reads: std::sync::Mutex<HashMap<Uuid, Vec<u8>>>,
        pub writes: std::sync::Mutex<Vec<(Uuid, Vec<u8>)>>,
        pub notifications: std::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
        pub unsubscribed: AtomicBool,
        pub gauge: std::sync::Mutex<Option<Arc<ConnectionGauge>>>,
    }

    #[derive(Clone)]
    pub struct MockNode {
        pub id: String,
        pub name: Option<String>,
        pub state: Arc<MockState>,
    }

    impl MockNode {
        pub fn new(id: &str) -> Self {
            MockNode {
                id: id.to_string(),
                name: Some(format!("DW{}", &id[id.len() - 5..].replace(':', ""))),
                state: Arc::new(MockState::default()),
            }
        }

        pub fn with_read(self, characteristic: Uuid, payload: Vec<u8>) -> Self {
            self.state
                .reads
                .lock()
                .unwrap()
                .insert(characteristic, payload);
            self
        }

        pub fn with_notifications(self, rx: mpsc::Receiver<Vec<u8>>) -> Self {
            *self.state.notifications.lock().unwrap() = Some(rx);
            self
        }

        pub fn with_gauge(self, gauge: Arc<ConnectionGauge>) -> Self {
            *self.state.gauge.lock().unwrap() = Some(gauge);
            self
        }

        pub fn with_connect_delay(self, delay: Duration) -> Self {
            self.state
                .connect_delay_ms
                .store(delay.as_millis() as u32, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl NodeTransport for MockNode {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn name(&self) -> Option<String> {
            self.name.clone()
        }

        async fn connect(&self, _timeout: Duration) -> Result<(), TransportError> {
            let failures = &self.state.connect_failures;
            if failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                return Err(TransportError::LinkLost);
            }
            let gauge = self.state.gauge.lock().unwrap().clone();
            if let Some(gauge) = &gauge {
                gauge.opened();
            }
            let delay = self.state.connect_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay.into())).await;
            }
            self.state.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            if self.state.connected.swap(false, Ordering::SeqCst) {
                let gauge = self.state.gauge.lock().unwrap().clone();
                if let Some(gauge) = &gauge {
                    gauge.closed();
                }
            }
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            self.state.connected.load(Ordering::SeqCst)
        }

        async fn read(
            &self,
            characteristic: Uuid,
            _timeout: Duration,
        ) -> Result<Vec<u8>, TransportError> {
            if self.state.fail_reads.load(Ordering::SeqCst) {
                return Err(TransportError::LinkLost);
            }
            self.state
                .reads
                .lock()
                .unwrap()
                .get(&characteristic)
                .cloned()
                .ok_or(TransportError::MissingCharacteristic(characteristic))
        }

        async fn write(
            &self,
            characteristic: Uuid,
            payload: &[u8],
            _ack: bool,
            _timeout: Duration,
        ) -> Result<(), TransportError> {
            self.state
                .writes
                .lock()
                .unwrap()
                .push((characteristic, payload.to_vec()));
            Ok(())
        }

        async fn subscribe(
            &self,
            characteristic: Uuid,
            _timeout: Duration,
        ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
            self.state
                .notifications
                .lock()
                .unwrap()
                .take()
                .ok_or(TransportError::MissingCharacteristic(characteristic))
        }

        async fn unsubscribe(&self, _characteristic: Uuid) -> Result<(), TransportError> {
            self.state.unsubscribed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockCentral {
        pub nodes: std::sync::Mutex<Vec<MockNode>>,
        pub fail_discovery: AtomicBool,
    }

    impl MockCentral {
        pub fn with_nodes(nodes: Vec<MockNode>) -> Self {
            MockCentral {
                nodes: std::sync::Mutex::new(nodes),
                fail_discovery: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Central for MockCentral {
        type Node = MockNode;

        async fn discover(&self, _timeout: Duration) -> Result<Vec<MockNode>, TransportError> {
            if self.fail_discovery.load(Ordering::SeqCst) {
                return Err(TransportError::LinkLost);
            }
            Ok(self.nodes.lock().unwrap().clone())
        }
    }
}
