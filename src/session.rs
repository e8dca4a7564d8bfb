//! One session per physical device: connect, configure, then either stream
//! (tags) or snapshot (anchors), with bounded retries in between.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::codec::{self, CoordinateEncoding, Position, uuids};
use crate::config::AppConfig;
use crate::messages::{DeviceIdentity, DeviceRole, DeviceStatus, LocationReading, TelemetryRecord};
use crate::registry::{IdentityUpdate, Registry};
use crate::transport::{NodeTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Configuring,
    Active(ActiveMode),
    Backoff,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveMode {
    /// One-shot characteristic reads (anchors).
    Polling,
    /// Notification-driven streaming (tags).
    Subscribed,
}

/// Resolved per-session knobs, lifted out of [`AppConfig`] once so the hot
/// paths never touch `Option`s.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    pub backoff_cap: Duration,
    pub frame_mode: u8,
    pub movement_threshold: f64,
    pub moving_interval: Duration,
    pub stationary_interval: Duration,
    pub liveness_interval: Duration,
    pub update_rate: Option<(u32, u32)>,
    pub anchor_deep_read: bool,
    pub encoding: CoordinateEncoding,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let session = config.session();
        SessionSettings {
            connect_timeout: session.connect_timeout(),
            io_timeout: session.io_timeout(),
            max_retries: session.max_retries(),
            backoff: session.backoff(),
            backoff_cap: session.backoff_cap(),
            frame_mode: session.frame_mode(),
            movement_threshold: session.movement_threshold(),
            moving_interval: session.moving_interval(),
            stationary_interval: session.stationary_interval(),
            liveness_interval: session.liveness_interval(),
            update_rate: session
                .update_rate
                .map(|rate| (rate.moving_ms, rate.stationary_ms)),
            anchor_deep_read: session.anchor_deep_read(),
            encoding: config.coordinate_encoding(),
        }
    }
}

pub struct DeviceSession<T, R> {
    identity: DeviceIdentity,
    transport: T,
    registry: Arc<R>,
    telemetry: mpsc::Sender<TelemetryRecord>,
    settings: SessionSettings,
    state: SessionState,
    last_position: Option<Position>,
    last_forwarded: Option<Instant>,
}

impl<T, R> DeviceSession<T, R>
where
    T: NodeTransport,
    R: Registry,
{
    pub fn new(
        identity: DeviceIdentity,
        transport: T,
        registry: Arc<R>,
        telemetry: mpsc::Sender<TelemetryRecord>,
        settings: SessionSettings,
    ) -> Self {
        DeviceSession {
            identity,
            transport,
            registry,
            telemetry,
            settings,
            state: SessionState::Idle,
            last_position: None,
            last_forwarded: None,
        }
    }

    /// Drive the session to its end: a completed anchor snapshot, or a
    /// disabled identity. Tags only leave through the retry budget.
    pub async fn run(mut self) -> SessionState {
        let mut failures = 0u32;
        loop {
            match self.cycle(&mut failures).await {
                Ok(()) => {
                    debug!("{}: session complete", self.identity.name);
                    self.state = SessionState::Idle;
                    return self.state;
                }
                Err(err) => {
                    failures += 1;
                    warn!(
                        "{}: transport failure {}/{}: {err}",
                        self.identity.name, failures, self.settings.max_retries
                    );
                    // Anchors are one-shot; their recovery path is the
                    // periodic re-check, not in-session retries.
                    if self.identity.role == DeviceRole::Anchor
                        || failures >= self.settings.max_retries
                    {
                        self.disable().await;
                        return self.state;
                    }
                    self.state = SessionState::Backoff;
                    tokio::time::sleep(self.backoff_delay(failures)).await;
                }
            }
        }
    }

    fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.settings
            .backoff
            .saturating_mul(1u32 << exponent)
            .min(self.settings.backoff_cap)
    }

    async fn cycle(&mut self, failures: &mut u32) -> Result<(), TransportError> {
        self.state = SessionState::Connecting;
        debug!("{}: connecting to {}", self.identity.name, self.identity.id);
        self.transport.connect(self.settings.connect_timeout).await?;

        let result = self.run_connected(failures).await;
        if result.is_err() {
            // Teardown before the retry so the next connect starts clean.
            let _ = self.transport.disconnect().await;
        }
        result
    }

    async fn run_connected(&mut self, failures: &mut u32) -> Result<(), TransportError> {
        self.state = SessionState::Configuring;
        self.transport
            .write(
                uuids::LOCATION_DATA_MODE,
                &[self.settings.frame_mode],
                true,
                self.settings.io_timeout,
            )
            .await?;
        if let Some((moving_ms, stationary_ms)) = self.settings.update_rate {
            self.transport
                .write(
                    uuids::UPDATE_RATE,
                    &codec::encode_update_rate(moving_ms, stationary_ms),
                    true,
                    self.settings.io_timeout,
                )
                .await?;
            // Read back what the firmware actually accepted.
            let raw = self
                .transport
                .read(uuids::UPDATE_RATE, self.settings.io_timeout)
                .await?;
            match codec::decode_update_rate(&raw) {
                Ok((moving, stationary)) => debug!(
                    "{}: update rate {moving}ms moving / {stationary}ms stationary",
                    self.identity.name
                ),
                Err(err) => warn!("{}: update rate read-back: {err}", self.identity.name),
            }
        }

        let mut operation_hex = None;
        if self.identity.role == DeviceRole::Unknown {
            let raw = self
                .transport
                .read(uuids::OPERATION_MODE, self.settings.io_timeout)
                .await?;
            operation_hex = Some(hex::encode(&raw));
            match codec::decode_operation_mode(&raw) {
                Ok(mode) => {
                    info!("{}: resolved role {:?}", self.identity.name, mode.role);
                    self.identity.role = mode.role;
                    if let Err(err) = self
                        .registry
                        .upsert(self.identity.id, IdentityUpdate::role(mode.role))
                        .await
                    {
                        warn!("{}: could not persist role: {err}", self.identity.name);
                    }
                }
                Err(err) => {
                    // Without a role we treat it as a tag, the long-lived kind.
                    warn!(
                        "{}: operation mode did not decode ({err}), running tag path",
                        self.identity.name
                    );
                }
            }
        }

        match self.identity.role {
            DeviceRole::Anchor => self.anchor_snapshot(operation_hex).await,
            DeviceRole::Tag | DeviceRole::Unknown => self.stream_tag(failures).await,
        }
    }

    /// Read the anchor once, report it, hang up.
    async fn anchor_snapshot(
        &mut self,
        operation_hex: Option<String>,
    ) -> Result<(), TransportError> {
        self.state = SessionState::Active(ActiveMode::Polling);

        let operation = match operation_hex {
            Some(operation) => operation,
            None => hex::encode(
                self.transport
                    .read(uuids::OPERATION_MODE, self.settings.io_timeout)
                    .await?,
            ),
        };

        // The on-device label, best effort.
        match self
            .transport
            .read(uuids::LABEL, self.settings.io_timeout)
            .await
        {
            Ok(label) => debug!(
                "{}: label {:?}",
                self.identity.name,
                String::from_utf8_lossy(&label)
            ),
            Err(err) => debug!("{}: label read failed: {err}", self.identity.name),
        }

        let info_raw = self
            .transport
            .read(uuids::DEVICE_INFO, self.settings.io_timeout)
            .await?;
        match codec::decode_device_info(&info_raw) {
            Ok(device) => debug!(
                "{}: node {} hw {} fw1 {} fw2 {} bridge {}",
                self.identity.name,
                device.node_id,
                device.hw_version,
                device.fw1_version,
                device.fw2_version,
                device.bridge
            ),
            Err(err) => warn!("{}: device info: {err}", self.identity.name),
        }

        let location_raw = self
            .transport
            .read(uuids::LOCATION_DATA, self.settings.io_timeout)
            .await?;
        let location = match codec::decode_location(&location_raw, self.settings.encoding) {
            Ok(sample) => LocationReading::Decoded(sample),
            Err(err) => {
                warn!("{}: location did not decode: {err}", self.identity.name);
                LocationReading::Raw(hex::encode(&location_raw))
            }
        };

        if self.settings.anchor_deep_read {
            self.anchor_deep_read().await;
        }

        self.emit(Some(operation), Some(location), DeviceStatus::Active)
            .await;
        if let Err(err) = self.transport.disconnect().await {
            debug!("{}: disconnect after snapshot: {err}", self.identity.name);
        }
        Ok(())
    }

    /// Diagnostic sweep over the anchor-only characteristics. Best effort,
    /// log only.
    async fn anchor_deep_read(&self) {
        for characteristic in [
            uuids::PERSISTED_POSITION,
            uuids::MAC_STATS,
            uuids::CLUSTER_INFO,
            uuids::ANCHOR_LIST,
        ] {
            match self
                .transport
                .read(characteristic, self.settings.io_timeout)
                .await
            {
                Ok(raw) => {
                    match codec::decode_anchor_aux(characteristic, &raw, self.settings.encoding) {
                        Ok(aux) => debug!("{}: {aux:?}", self.identity.name),
                        Err(err) => warn!("{}: aux payload: {err}", self.identity.name),
                    }
                }
                Err(err) => debug!("{}: aux read failed: {err}", self.identity.name),
            }
        }
    }

    /// Subscribe to the location stream and forward samples at the
    /// adaptive rate until the link dies.
    async fn stream_tag(&mut self, failures: &mut u32) -> Result<(), TransportError> {
        let mut frames = self
            .transport
            .subscribe(uuids::LOCATION_DATA, self.settings.io_timeout)
            .await?;
        self.state = SessionState::Active(ActiveMode::Subscribed);
        info!("{}: subscribed to location stream", self.identity.name);
        // Reaching the active state resets the consecutive-failure budget.
        *failures = 0;

        let lost = loop {
            match tokio::time::timeout(self.settings.liveness_interval, frames.recv()).await {
                Ok(Some(frame)) => self.handle_frame(&frame).await,
                Ok(None) => break TransportError::LinkLost,
                Err(_) => {
                    if !self.transport.is_connected().await {
                        break TransportError::LinkLost;
                    }
                    debug!(
                        "{}: no frames for {:?}, link still up",
                        self.identity.name, self.settings.liveness_interval
                    );
                }
            }
        };

        // Deterministic teardown before the retry (or the slot release).
        let _ = self.transport.unsubscribe(uuids::LOCATION_DATA).await;
        Err(lost)
    }

    async fn handle_frame(&mut self, frame: &[u8]) {
        let sample = match codec::decode_location(frame, self.settings.encoding) {
            Ok(sample) => sample,
            Err(err) => {
                // A malformed frame never terminates the session.
                warn!("{}: dropping malformed frame: {err}", self.identity.name);
                return;
            }
        };

        let moving = match (&self.last_position, sample.position()) {
            (Some(last), Some(current)) => {
                let threshold = self.settings.movement_threshold;
                (current.x - last.x).abs() > threshold
                    || (current.y - last.y).abs() > threshold
                    || (current.z - last.z).abs() > threshold
            }
            _ => false,
        };
        if let Some(current) = sample.position() {
            self.last_position = Some(current.clone());
        }

        let interval = if moving {
            self.settings.moving_interval
        } else {
            self.settings.stationary_interval
        };
        let due = self
            .last_forwarded
            .is_none_or(|at| at.elapsed() >= interval);
        if !due {
            debug!("{}: sample within {interval:?}, holding", self.identity.name);
            return;
        }

        self.emit(
            None,
            Some(LocationReading::Decoded(sample)),
            DeviceStatus::Active,
        )
        .await;
        self.last_forwarded = Some(Instant::now());
    }

    async fn disable(&mut self) {
        self.state = SessionState::Disabled;
        info!("{}: disabling after repeated failures", self.identity.name);
        if let Err(err) = self
            .registry
            .upsert(self.identity.id, IdentityUpdate::status(DeviceStatus::Disable))
            .await
        {
            warn!(
                "{}: could not persist disabled status: {err}",
                self.identity.name
            );
        }
        self.identity.status = DeviceStatus::Disable;
        self.emit(None, None, DeviceStatus::Disable).await;
    }

    async fn emit(
        &self,
        operation: Option<String>,
        location: Option<LocationReading>,
        status: DeviceStatus,
    ) {
        let record = TelemetryRecord::new(self.identity.clone(), operation, location, status);
        if self.telemetry.send(record).await.is_err() {
            warn!(
                "telemetry channel closed, dropping record for {}",
                self.identity.id
            );
        }
    }
}
