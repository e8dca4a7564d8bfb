//! Freshness-biased fan-in: every session pushes records at it, it keeps
//! only the newest per device and forwards the lot on a fixed tick.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::backend::BackendSink;
use crate::messages::TelemetryRecord;

pub struct TelemetryDispatcher<B> {
    rx: mpsc::Receiver<TelemetryRecord>,
    backend: B,
    interval: Duration,
    /// Device id -> newest unsent record. Explicitly lossy: a fresh record
    /// replaces an unsent stale one.
    pending: HashMap<String, TelemetryRecord>,
}

impl<B: BackendSink> TelemetryDispatcher<B> {
    pub fn new(rx: mpsc::Receiver<TelemetryRecord>, backend: B, interval: Duration) -> Self {
        TelemetryDispatcher {
            rx,
            backend,
            interval,
            pending: HashMap::new(),
        }
    }

    /// Run until every sender is gone, then flush once and stop.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                record = self.rx.recv() => match record {
                    Some(record) => self.upsert(record),
                    None => {
                        self.drain().await;
                        debug!("telemetry channel closed, dispatcher stopping");
                        return;
                    }
                },
                _ = tick.tick() => self.drain().await,
            }
        }
    }

    fn upsert(&mut self, record: TelemetryRecord) {
        let key = record.identity.id.to_string();
        if self.pending.insert(key, record).is_some() {
            debug!("superseded an unsent record");
        }
    }

    async fn drain(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        debug!("forwarding {} records", batch.len());
        for (_, record) in batch {
            // One failed send never touches the rest, and is not retried.
            if let Err(err) = self.backend.send(&record).await {
                warn!("dropping record for {}: {err}", record.identity.id);
            }
        }
    }
}
