//! Rates derived from consecutive statistics reports

use std::collections::HashMap;

use super::report::{RawStatsReport, INBOUND_RTP, OUTBOUND_RTP};

/// Scale applied to a computed rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateModifier {
    None,
    /// bytes -> bits
    Bits,
    /// seconds -> milliseconds
    Milliseconds,
}

impl RateModifier {
    pub fn factor(self) -> f64 {
        match self {
            RateModifier::None => 1.0,
            RateModifier::Bits => 8.0,
            RateModifier::Milliseconds => 1000.0,
        }
    }
}

/// `Δaccumulative / Δsample` for one kind of stats object
#[derive(Debug, Clone, Copy)]
pub struct RateCalculator {
    pub stats_type: &'static str,
    pub accumulative: &'static str,
    pub sample: &'static str,
    pub modifier: RateModifier,
    pub name: &'static str,
}

impl RateCalculator {
    const fn new(
        stats_type: &'static str,
        accumulative: &'static str,
        sample: &'static str,
        modifier: RateModifier,
        name: &'static str,
    ) -> Self {
        Self {
            stats_type,
            accumulative,
            sample,
            modifier,
            name,
        }
    }

    /// Rate for stats object `id`, or `None` when it cannot be computed
    /// (missing report or id, time not advancing, sample counter not advancing).
    pub fn calculate(
        &self,
        id: &str,
        previous: Option<&RawStatsReport>,
        current: Option<&RawStatsReport>,
    ) -> Option<f64> {
        let prev = previous?.get(id)?;
        let curr = current?.get(id)?;
        if curr.timestamp - prev.timestamp <= 0.0 {
            return None;
        }

        let accum_delta = curr.value(self.accumulative)? - prev.value(self.accumulative)?;
        let sample_delta = curr.value(self.sample)? - prev.value(self.sample)?;
        if sample_delta <= 0.0 {
            return None;
        }

        Some(accum_delta / sample_delta * self.modifier.factor())
    }
}

/// Every rate computed on each new report
pub const RATE_CALCULATORS: &[RateCalculator] = &[
    RateCalculator::new(OUTBOUND_RTP, "bytesSent", "timestamp", RateModifier::Bits, "[bytesSent_in_bits/s]"),
    RateCalculator::new(OUTBOUND_RTP, "headerBytesSent", "timestamp", RateModifier::Bits, "[headerBytesSent_in_bits/s]"),
    RateCalculator::new(OUTBOUND_RTP, "packetsSent", "timestamp", RateModifier::None, "[packetsSent/s]"),
    RateCalculator::new(INBOUND_RTP, "bytesReceived", "timestamp", RateModifier::Bits, "[bytesReceived_in_bits/s]"),
    RateCalculator::new(INBOUND_RTP, "headerBytesReceived", "timestamp", RateModifier::Bits, "[headerBytesReceived_in_bits/s]"),
    RateCalculator::new(INBOUND_RTP, "concealedSamples", "timestamp", RateModifier::None, "[concealedSamples/s]"),
    RateCalculator::new(INBOUND_RTP, "concealedSamples", "totalSamplesReceived", RateModifier::None, "[concealedSamples/totalSamplesReceived]"),
    RateCalculator::new(INBOUND_RTP, "silentConcealedSamples", "timestamp", RateModifier::None, "[silentConcealedSamples/s]"),
    RateCalculator::new(INBOUND_RTP, "insertedSamplesForDeceleration", "timestamp", RateModifier::None, "[insertedSamplesForDeceleration/s]"),
    RateCalculator::new(INBOUND_RTP, "removedSamplesForAcceleration", "timestamp", RateModifier::None, "[removedSamplesForAcceleration/s]"),
    RateCalculator::new(INBOUND_RTP, "jitterBufferDelay", "jitterBufferEmittedCount", RateModifier::Milliseconds, "[jitterBufferDelay/jitterBufferEmittedCount_in_ms]"),
];

/// Rates computed from one pair of reports, keyed by stats object id and rate name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateTable {
    rates: HashMap<String, HashMap<&'static str, f64>>,
}

impl RateTable {
    pub fn get(&self, id: &str, name: &str) -> Option<f64> {
        self.rates.get(id)?.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

/// Keeps the last two reports and recomputes the rate table on every new one
#[derive(Debug, Default)]
pub struct StatsRatesCalculator {
    previous: Option<RawStatsReport>,
    current: Option<RawStatsReport>,
}

impl StatsRatesCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift current to previous, store `report`, and return a fresh table.
    pub fn add_report(&mut self, report: RawStatsReport) -> RateTable {
        self.previous = self.current.replace(report);
        self.compute()
    }

    pub fn current(&self) -> Option<&RawStatsReport> {
        self.current.as_ref()
    }

    fn compute(&self) -> RateTable {
        let mut table = RateTable::default();
        let Some(current) = self.current.as_ref() else {
            return table;
        };

        for entry in current.entries() {
            for calc in RATE_CALCULATORS.iter().filter(|c| c.stats_type == entry.stats_type) {
                if let Some(rate) = calc.calculate(&entry.id, self.previous.as_ref(), Some(current)) {
                    table
                        .rates
                        .entry(entry.id.clone())
                        .or_default()
                        .insert(calc.name, rate);
                }
            }
        }
        table
    }
}
