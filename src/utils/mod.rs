//! Utility modules shared across sessions

pub mod throttle;

pub use throttle::LogThrottler;
