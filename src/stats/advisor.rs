//! FEC recommendation from packet loss trends

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use super::snapshot::{StatsHistory, StatsSnapshot};

/// FEC policy the advisor recommends
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FecRecommendation {
    NoChange,
    /// Opus in-band FEC
    InbandFec,
    /// Redundant encoding (RED)
    RedundantFec,
}

impl FecRecommendation {
    fn protection(self) -> u8 {
        match self {
            Self::NoChange => 0,
            Self::InbandFec => 1,
            Self::RedundantFec => 2,
        }
    }

    /// The more protective of the two
    pub fn stronger(self, other: Self) -> Self {
        if other.protection() > self.protection() {
            other
        } else {
            self
        }
    }
}

/// Maps loss over the last interval to a FEC policy.
///
/// Loss in `(0, red_threshold)` recommends in-band FEC, loss at or above the
/// threshold recommends RED. Advisory only; the session decides.
#[derive(Debug, Clone, Copy)]
pub struct QualityAdvisor {
    red_threshold: f64,
}

impl QualityAdvisor {
    pub fn new(red_threshold: f64) -> Self {
        Self { red_threshold }
    }

    /// `Δlost / Δ(lost + received)`, `None` when counters are missing or
    /// nothing was expected over the interval.
    pub fn loss_fraction(previous: &StatsSnapshot, current: &StatsSnapshot) -> Option<f64> {
        let prev_lost = previous.inbound.packets_lost? as f64;
        let prev_recv = previous.inbound.packets_received? as f64;
        let curr_lost = current.inbound.packets_lost? as f64;
        let curr_recv = current.inbound.packets_received? as f64;

        let expected = (curr_lost + curr_recv) - (prev_lost + prev_recv);
        if expected <= 0.0 {
            return None;
        }
        Some((curr_lost - prev_lost) / expected)
    }

    pub fn recommend(&self, history: &StatsHistory) -> FecRecommendation {
        let Some((previous, current)) = history.last_pair() else {
            return FecRecommendation::NoChange;
        };

        match Self::loss_fraction(previous, current) {
            Some(f) if f >= self.red_threshold => FecRecommendation::RedundantFec,
            Some(f) if f > 0.0 => FecRecommendation::InbandFec,
            _ => FecRecommendation::NoChange,
        }
    }
}

impl Default for QualityAdvisor {
    fn default() -> Self {
        Self::new(0.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_two_snapshots() {
        let advisor = QualityAdvisor::default();
        let mut history = StatsHistory::new();
        assert_eq!(advisor.recommend(&history), FecRecommendation::NoChange);

        history.push(StatsSnapshot::with_counters(50, 50));
        assert_eq!(advisor.recommend(&history), FecRecommendation::NoChange);
    }

    #[test]
    fn test_loss_sequence_over_three_ticks() {
        let advisor = QualityAdvisor::default();
        let mut history = StatsHistory::new();

        history.push(StatsSnapshot::with_counters(0, 100));
        assert_eq!(advisor.recommend(&history), FecRecommendation::NoChange);

        history.push(StatsSnapshot::with_counters(5, 195));
        let (prev, curr) = history.last_pair().unwrap();
        assert_eq!(QualityAdvisor::loss_fraction(prev, curr), Some(0.05));
        assert_eq!(advisor.recommend(&history), FecRecommendation::InbandFec);

        history.push(StatsSnapshot::with_counters(5, 195));
        let (prev, curr) = history.last_pair().unwrap();
        assert_eq!(QualityAdvisor::loss_fraction(prev, curr), None);
        assert_eq!(advisor.recommend(&history), FecRecommendation::NoChange);
    }

    #[test]
    fn test_heavy_loss_recommends_red() {
        let advisor = QualityAdvisor::default();
        let mut history = StatsHistory::new();
        history.push(StatsSnapshot::with_counters(0, 100));
        history.push(StatsSnapshot::with_counters(20, 180));
        assert_eq!(advisor.recommend(&history), FecRecommendation::RedundantFec);
    }

    #[test]
    fn test_no_loss_no_change() {
        let advisor = QualityAdvisor::default();
        let mut history = StatsHistory::new();
        history.push(StatsSnapshot::with_counters(3, 100));
        history.push(StatsSnapshot::with_counters(3, 200));
        assert_eq!(advisor.recommend(&history), FecRecommendation::NoChange);
    }

    #[test]
    fn test_stronger_prefers_more_protection() {
        use FecRecommendation::*;
        assert_eq!(NoChange.stronger(InbandFec), InbandFec);
        assert_eq!(InbandFec.stronger(NoChange), InbandFec);
        assert_eq!(InbandFec.stronger(RedundantFec), RedundantFec);
        assert_eq!(RedundantFec.stronger(InbandFec), RedundantFec);
        assert_eq!(NoChange.stronger(NoChange), NoChange);
    }

    #[test]
    fn test_missing_counters() {
        let advisor = QualityAdvisor::default();
        let mut history = StatsHistory::new();
        let mut snapshot = StatsSnapshot::with_counters(0, 100);
        snapshot.inbound.packets_lost = None;
        history.push(snapshot);
        history.push(StatsSnapshot::with_counters(5, 195));
        assert_eq!(advisor.recommend(&history), FecRecommendation::NoChange);
    }
}
