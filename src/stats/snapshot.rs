//! Point-in-time audio statistics and their short history

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rates::RateTable;
use super::report::{RawStatsReport, INBOUND_RTP, OUTBOUND_RTP, REMOTE_INBOUND_RTP, REMOTE_OUTBOUND_RTP};

/// Snapshots kept per session
pub const STATS_HISTORY_CAPACITY: usize = 3;

/// Receive side. Rates computed over millisecond timestamps, so byte rates
/// scaled to bits come out in kbit/s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundAudioStats {
    pub jitter_ms: Option<f64>,
    pub jitter_buffer_delay_ms: Option<f64>,
    pub packets_lost: Option<u64>,
    pub packets_received: Option<u64>,
    pub fec_packets_received: Option<u64>,
    pub fec_packets_discarded: Option<u64>,
    pub header_kbps: Option<f64>,
    pub payload_kbps: Option<f64>,
    pub inserted_samples_rate: Option<f64>,
    pub removed_samples_rate: Option<f64>,
    pub concealed_samples_rate: Option<f64>,
    pub silent_concealed_samples_rate: Option<f64>,
}

/// Send side
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundAudioStats {
    pub packets_sent_per_sec: Option<f64>,
    pub total_kbps: Option<f64>,
    pub header_kbps: Option<f64>,
}

/// What the remote end reports about its own sending
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteAudioStats {
    pub packets_sent: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub captured_at: DateTime<Utc>,
    pub inbound: InboundAudioStats,
    pub outbound: OutboundAudioStats,
    pub remote: RemoteAudioStats,
}

fn counter(value: Option<f64>) -> Option<u64> {
    value.filter(|v| v.is_finite() && *v >= 0.0).map(|v| v as u64)
}

impl StatsSnapshot {
    /// Snapshot with only the loss counters set
    pub fn with_counters(packets_lost: u64, packets_received: u64) -> Self {
        Self {
            captured_at: Utc::now(),
            inbound: InboundAudioStats {
                packets_lost: Some(packets_lost),
                packets_received: Some(packets_received),
                ..Default::default()
            },
            outbound: OutboundAudioStats::default(),
            remote: RemoteAudioStats::default(),
        }
    }

    /// Combine the raw counters of `report` with the rates computed for it.
    pub fn from_report(report: &RawStatsReport, rates: &RateTable) -> Self {
        let mut inbound = InboundAudioStats::default();
        let mut outbound = OutboundAudioStats::default();
        let mut remote = RemoteAudioStats::default();

        if let Some(entry) = report.audio_entry(REMOTE_OUTBOUND_RTP) {
            remote.packets_sent = counter(entry.value("packetsSent"));
        }

        if let Some(entry) = report.audio_entry(INBOUND_RTP) {
            let rate = |name: &str| rates.get(&entry.id, name);
            inbound.jitter_ms = entry.value("jitter").map(|s| s * 1000.0);
            inbound.jitter_buffer_delay_ms = rate("[jitterBufferDelay/jitterBufferEmittedCount_in_ms]");
            inbound.packets_received = counter(entry.value("packetsReceived"));
            inbound.fec_packets_received = counter(entry.value("fecPacketsReceived"));
            inbound.fec_packets_discarded = counter(entry.value("fecPacketsDiscarded"));
            inbound.header_kbps = rate("[headerBytesReceived_in_bits/s]");
            inbound.payload_kbps = rate("[bytesReceived_in_bits/s]");
            inbound.inserted_samples_rate = rate("[insertedSamplesForDeceleration/s]");
            inbound.removed_samples_rate = rate("[removedSamplesForAcceleration/s]");
            inbound.concealed_samples_rate = rate("[concealedSamples/s]");
            inbound.silent_concealed_samples_rate = rate("[silentConcealedSamples/s]");

            inbound.packets_lost = counter(entry.value("packetsLost"))
                .or_else(|| {
                    report
                        .audio_entry(REMOTE_INBOUND_RTP)
                        .and_then(|e| counter(e.value("packetsLost")))
                })
                .or_else(|| match (remote.packets_sent, inbound.packets_received) {
                    (Some(sent), Some(received)) => Some(sent.saturating_sub(received)),
                    _ => None,
                });
        }

        if let Some(entry) = report.audio_entry(OUTBOUND_RTP) {
            let rate = |name: &str| rates.get(&entry.id, name);
            // per-ms timestamps
            outbound.packets_sent_per_sec = rate("[packetsSent/s]").map(|r| r * 1000.0);
            outbound.total_kbps = rate("[bytesSent_in_bits/s]");
            outbound.header_kbps = rate("[headerBytesSent_in_bits/s]");
        }

        Self {
            captured_at: Utc::now(),
            inbound,
            outbound,
            remote,
        }
    }
}

/// Fixed-capacity history, newest last
#[derive(Debug, Clone, Default)]
pub struct StatsHistory {
    snapshots: VecDeque<StatsSnapshot>,
}

impl StatsHistory {
    pub fn new() -> Self {
        Self {
            snapshots: VecDeque::with_capacity(STATS_HISTORY_CAPACITY),
        }
    }

    /// Push the newest snapshot, dropping the oldest beyond capacity.
    pub fn push(&mut self, snapshot: StatsSnapshot) {
        self.snapshots.push_back(snapshot);
        while self.snapshots.len() > STATS_HISTORY_CAPACITY {
            self.snapshots.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&StatsSnapshot> {
        self.snapshots.back()
    }

    /// The two newest snapshots, older first
    pub fn last_pair(&self) -> Option<(&StatsSnapshot, &StatsSnapshot)> {
        let n = self.snapshots.len();
        if n < 2 {
            return None;
        }
        Some((&self.snapshots[n - 2], &self.snapshots[n - 1]))
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StatsSnapshot> {
        self.snapshots.iter()
    }
}
