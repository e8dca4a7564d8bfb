//! Drives the gateway: periodic discovery cycles matched against the
//! registry, one session task per eligible device, all connection-holding
//! work gated behind one counting semaphore.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

use crate::codec::uuids;
use crate::config::AppConfig;
use crate::messages::{DeviceIdentity, DeviceRole, DeviceStatus, TelemetryRecord};
use crate::registry::{IdentityUpdate, Registry};
use crate::session::{DeviceSession, SessionSettings};
use crate::transport::{Central, NodeTransport, TransportError};

pub struct Scheduler<C: Central, R> {
    central: C,
    registry: Arc<R>,
    telemetry: mpsc::Sender<TelemetryRecord>,
    /// Counting semaphore bounding simultaneously connected sessions.
    limiter: Arc<Semaphore>,
    /// Ids with a live session task, so a scan cycle never double-spawns.
    running: Arc<Mutex<HashSet<String>>>,
    settings: SessionSettings,
    scan_interval: Duration,
    discovery_timeout: Duration,
    anchor_check_interval: Duration,
}

impl<C, R> Scheduler<C, R>
where
    C: Central,
    R: Registry + 'static,
{
    pub fn new(
        central: C,
        registry: Arc<R>,
        telemetry: mpsc::Sender<TelemetryRecord>,
        config: &AppConfig,
    ) -> Self {
        let scan = config.scan();
        Scheduler {
            central,
            registry,
            telemetry,
            limiter: Arc::new(Semaphore::new(scan.max_connections())),
            running: Arc::new(Mutex::new(HashSet::new())),
            settings: SessionSettings::from_config(config),
            scan_interval: scan.interval(),
            discovery_timeout: scan.discovery_timeout(),
            anchor_check_interval: scan.anchor_check_interval(),
        }
    }

    /// Run scan cycles and anchor re-checks forever.
    pub async fn run(&self) {
        let scans = async {
            loop {
                self.scan_cycle().await;
                tokio::time::sleep(self.scan_interval).await;
            }
        };
        let anchor_checks = async {
            loop {
                tokio::time::sleep(self.anchor_check_interval).await;
                self.check_anchors().await;
            }
        };
        tokio::join!(scans, anchor_checks);
    }

    /// One discovery pass: match reachable devices against the registry and
    /// start sessions for the enabled ones.
    async fn scan_cycle(&self) -> Vec<JoinHandle<()>> {
        let identities = match self.registry.load().await {
            Ok(identities) => identities,
            Err(err) => {
                warn!("registry unreadable, running with no devices: {err}");
                Vec::new()
            }
        };

        let discovered = match self.central.discover(self.discovery_timeout).await {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!("discovery failed: {err}");
                return Vec::new();
            }
        };
        debug!(
            "scan cycle: {} discovered, {} registered",
            discovered.len(),
            identities.len()
        );
        let mut by_id: HashMap<String, C::Node> = discovered
            .into_iter()
            .map(|node| (node.id().to_uppercase(), node))
            .collect();

        let mut handles = Vec::new();
        for identity in identities {
            if identity.status == DeviceStatus::Disable {
                debug!("{}: disabled, not connecting", identity.name);
                continue;
            }
            let key = identity.id.to_string().to_uppercase();
            if self.running.lock().unwrap().contains(&key) {
                debug!("{}: session already running", identity.name);
                continue;
            }
            match by_id.remove(&key) {
                Some(node) => handles.push(self.spawn_session(key, node, identity)),
                None => info!("{}: registered but not discovered this cycle", identity.name),
            }
        }
        for node in by_id.values() {
            debug!(
                "{} ({}): discovered but not registered, ignoring",
                node.id(),
                node.name().unwrap_or_default()
            );
        }
        handles
    }

    fn spawn_session(
        &self,
        key: String,
        node: C::Node,
        identity: DeviceIdentity,
    ) -> JoinHandle<()> {
        self.running.lock().unwrap().insert(key.clone());
        let limiter = self.limiter.clone();
        let running = self.running.clone();
        let session = DeviceSession::new(
            identity,
            node,
            self.registry.clone(),
            self.telemetry.clone(),
            self.settings.clone(),
        );
        tokio::spawn(async move {
            // The slot is taken before the transport connects and held for
            // the whole session.
            if let Ok(_permit) = limiter.acquire_owned().await {
                session.run().await;
            }
            running.lock().unwrap().remove(&key);
        })
    }

    /// Re-check previously active anchors, under the same connection bound
    /// as regular sessions.
    async fn check_anchors(&self) -> Vec<JoinHandle<()>> {
        let identities = match self.registry.load().await {
            Ok(identities) => identities,
            Err(err) => {
                warn!("registry unreadable, skipping anchor checks: {err}");
                return Vec::new();
            }
        };
        let anchors: Vec<_> = identities
            .into_iter()
            .filter(|identity| {
                identity.role == DeviceRole::Anchor && identity.status == DeviceStatus::Active
            })
            .collect();
        if anchors.is_empty() {
            return Vec::new();
        }

        let discovered = match self.central.discover(self.discovery_timeout).await {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!("discovery for anchor check failed: {err}");
                return Vec::new();
            }
        };
        let mut by_id: HashMap<String, C::Node> = discovered
            .into_iter()
            .map(|node| (node.id().to_uppercase(), node))
            .collect();

        let mut handles = Vec::new();
        for identity in anchors {
            let key = identity.id.to_string().to_uppercase();
            if self.running.lock().unwrap().contains(&key) {
                continue;
            }
            match by_id.remove(&key) {
                Some(node) => handles.push(self.spawn_anchor_check(key, node, identity)),
                None => {
                    // The original gateway treats an unreachable anchor as
                    // failed, and so do we.
                    warn!("{}: anchor not reachable", identity.name);
                    handles.push(self.spawn_anchor_failure(identity));
                }
            }
        }
        handles
    }

    fn spawn_anchor_check(
        &self,
        key: String,
        node: C::Node,
        identity: DeviceIdentity,
    ) -> JoinHandle<()> {
        self.running.lock().unwrap().insert(key.clone());
        let limiter = self.limiter.clone();
        let running = self.running.clone();
        let registry = self.registry.clone();
        let telemetry = self.telemetry.clone();
        let connect_timeout = self.settings.connect_timeout;
        let io_timeout = self.settings.io_timeout;
        tokio::spawn(async move {
            if let Ok(_permit) = limiter.acquire_owned().await {
                check_anchor(node, identity, registry, telemetry, connect_timeout, io_timeout)
                    .await;
            }
            running.lock().unwrap().remove(&key);
        })
    }

    fn spawn_anchor_failure(&self, identity: DeviceIdentity) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let telemetry = self.telemetry.clone();
        tokio::spawn(async move {
            mark_anchor_failed(identity, &registry, &telemetry).await;
        })
    }
}

async fn check_anchor<T: NodeTransport, R: Registry>(
    node: T,
    identity: DeviceIdentity,
    registry: Arc<R>,
    telemetry: mpsc::Sender<TelemetryRecord>,
    connect_timeout: Duration,
    io_timeout: Duration,
) {
    let healthy = async {
        node.connect(connect_timeout).await?;
        node.read(uuids::OPERATION_MODE, io_timeout).await?;
        Ok::<_, TransportError>(())
    }
    .await;
    let _ = node.disconnect().await;

    match healthy {
        Ok(()) => {
            debug!("{}: anchor healthy", identity.name);
            if let Err(err) = registry
                .upsert(identity.id, IdentityUpdate::status(DeviceStatus::Active))
                .await
            {
                warn!("{}: could not refresh status: {err}", identity.name);
            }
        }
        Err(err) => {
            warn!("{}: anchor check failed: {err}", identity.name);
            mark_anchor_failed(identity, &registry, &telemetry).await;
        }
    }
}

async fn mark_anchor_failed<R: Registry>(
    mut identity: DeviceIdentity,
    registry: &Arc<R>,
    telemetry: &mpsc::Sender<TelemetryRecord>,
) {
    if let Err(err) = registry
        .upsert(identity.id, IdentityUpdate::status(DeviceStatus::Disable))
        .await
    {
        warn!("{}: could not persist disabled status: {err}", identity.name);
    }
    identity.status = DeviceStatus::Disable;
    let record = TelemetryRecord::new(identity, None, None, DeviceStatus::Disable);
    if telemetry.send(record).await.is_err() {
        warn!("telemetry channel closed, dropping anchor failure record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::uuids;
    use crate::registry::FileRegistry;
    use crate::transport::mock::{ConnectionGauge, MockCentral, MockNode};
    use std::sync::atomic::Ordering;

    fn config(max_connections: usize) -> AppConfig {
        toml::de::from_str(&format!(
            r#"
            [backend]
            url = "http://localhost:5000/uwb"

            [scan]
            max_connections = {max_connections}

            [session]
            max_retries = 1
            backoff_seconds = 1
        "#
        ))
        .unwrap()
    }

    async fn registry_with(
        entries: &[(&str, DeviceRole, DeviceStatus)],
    ) -> (tempfile::TempDir, Arc<FileRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FileRegistry::new(dir.path().join("modules.json")));
        for (id, role, status) in entries {
            registry
                .upsert(
                    id.parse().unwrap(),
                    IdentityUpdate {
                        role: Some(*role),
                        status: Some(*status),
                    },
                )
                .await
                .unwrap();
        }
        (dir, registry)
    }

    fn anchor_node(id: &str) -> MockNode {
        let mut info = vec![0u8; 29];
        info[..8].copy_from_slice(&[0xDE, 0xCA, 0, 0, 0, 0, 0, 1]);
        MockNode::new(id)
            .with_read(uuids::OPERATION_MODE, vec![0x80, 0x00])
            .with_read(uuids::DEVICE_INFO, info)
            .with_read(uuids::LOCATION_DATA, {
                let mut frame = vec![0u8];
                frame.extend_from_slice(&1000i32.to_le_bytes());
                frame.extend_from_slice(&2000i32.to_le_bytes());
                frame.extend_from_slice(&3000i32.to_le_bytes());
                frame.push(90);
                frame
            })
    }

    #[tokio::test]
    async fn connections_never_exceed_the_bound() {
        let ids = [
            "AA:BB:CC:00:00:01",
            "AA:BB:CC:00:00:02",
            "AA:BB:CC:00:00:03",
            "AA:BB:CC:00:00:04",
            "AA:BB:CC:00:00:05",
        ];
        let entries: Vec<_> = ids
            .iter()
            .map(|id| (*id, DeviceRole::Anchor, DeviceStatus::Active))
            .collect();
        let (_dir, registry) = registry_with(&entries).await;

        let gauge = Arc::new(ConnectionGauge::default());
        let nodes = ids
            .iter()
            .map(|id| {
                anchor_node(id)
                    .with_gauge(gauge.clone())
                    .with_connect_delay(Duration::from_millis(10))
            })
            .collect();
        let central = MockCentral::with_nodes(nodes);

        let (tx, mut rx) = mpsc::channel(32);
        let scheduler = Scheduler::new(central, registry, tx, &config(2));
        for handle in scheduler.scan_cycle().await {
            handle.await.unwrap();
        }

        assert!(
            gauge.peak.load(Ordering::SeqCst) <= 2,
            "peak {} exceeded the bound",
            gauge.peak.load(Ordering::SeqCst)
        );
        // Every anchor still got its snapshot through.
        for _ in &ids {
            assert_eq!(rx.recv().await.unwrap().status, DeviceStatus::Active);
        }
    }

    #[tokio::test]
    async fn disabled_identities_are_never_contacted() {
        let (_dir, registry) = registry_with(&[(
            "AA:BB:CC:00:00:01",
            DeviceRole::Anchor,
            DeviceStatus::Disable,
        )])
        .await;
        let node = anchor_node("AA:BB:CC:00:00:01");
        let state = node.state.clone();
        let central = MockCentral::with_nodes(vec![node]);

        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(central, registry, tx, &config(2));
        let handles = scheduler.scan_cycle().await;
        assert!(handles.is_empty());
        assert!(!state.connected.load(Ordering::SeqCst));
        assert!(state.writes.lock().unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unmatched_and_already_running_entries_are_skipped() {
        let (_dir, registry) = registry_with(&[
            ("AA:BB:CC:00:00:01", DeviceRole::Tag, DeviceStatus::Active),
            ("AA:BB:CC:00:00:02", DeviceRole::Tag, DeviceStatus::Active),
        ])
        .await;
        // Only the second is reachable, and it already has a session.
        let central = MockCentral::with_nodes(vec![anchor_node("AA:BB:CC:00:00:02")]);

        let (tx, _rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(central, registry, tx, &config(2));
        scheduler
            .running
            .lock()
            .unwrap()
            .insert("AA:BB:CC:00:00:02".to_string());

        assert!(scheduler.scan_cycle().await.is_empty());
    }

    #[tokio::test]
    async fn unreadable_registry_means_no_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modules.json");
        tokio::fs::write(&path, "not json").await.unwrap();
        let registry = Arc::new(FileRegistry::new(&path));
        let central = MockCentral::with_nodes(vec![anchor_node("AA:BB:CC:00:00:01")]);

        let (tx, _rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(central, registry, tx, &config(2));
        assert!(scheduler.scan_cycle().await.is_empty());
    }

    #[tokio::test]
    async fn failed_anchor_check_disables_and_reports() {
        let (_dir, registry) = registry_with(&[(
            "C8:70:52:60:9F:38",
            DeviceRole::Anchor,
            DeviceStatus::Active,
        )])
        .await;
        let node = MockNode::new("C8:70:52:60:9F:38");
        node.state.fail_reads.store(true, Ordering::SeqCst);
        let central = MockCentral::with_nodes(vec![node]);

        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(central, registry.clone(), tx, &config(2));
        for handle in scheduler.check_anchors().await {
            handle.await.unwrap();
        }

        let record = rx.recv().await.unwrap();
        assert_eq!(record.status, DeviceStatus::Disable);
        assert_eq!(
            registry.load().await.unwrap()[0].status,
            DeviceStatus::Disable
        );
        // A disabled anchor is left alone on the next pass.
        assert!(scheduler.check_anchors().await.is_empty());
    }

    #[tokio::test]
    async fn undiscovered_anchor_counts_as_failed() {
        let (_dir, registry) = registry_with(&[(
            "C8:70:52:60:9F:38",
            DeviceRole::Anchor,
            DeviceStatus::Active,
        )])
        .await;
        let central = MockCentral::default();

        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(central, registry.clone(), tx, &config(2));
        for handle in scheduler.check_anchors().await {
            handle.await.unwrap();
        }

        assert_eq!(rx.recv().await.unwrap().status, DeviceStatus::Disable);
        assert_eq!(
            registry.load().await.unwrap()[0].status,
            DeviceStatus::Disable
        );
    }
}
