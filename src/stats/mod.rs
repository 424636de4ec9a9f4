//! Transport statistics: rates, snapshots and FEC advice

pub mod advisor;
pub mod rates;
pub mod report;
pub mod snapshot;

pub use advisor::{FecRecommendation, QualityAdvisor};
pub use rates::{RateCalculator, RateModifier, RateTable, StatsRatesCalculator, RATE_CALCULATORS};
pub use report::{RawStatsReport, StatsEntry};
pub use snapshot::{
    InboundAudioStats, OutboundAudioStats, RemoteAudioStats, StatsHistory, StatsSnapshot,
    STATS_HISTORY_CAPACITY,
};
