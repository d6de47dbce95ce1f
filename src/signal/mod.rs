//! Signal generation: W/M pattern detection, higher-timeframe trend
//! filtering, and the pending-signal queue feeding the position engine.

pub mod pattern;
pub mod queue;
pub mod trend;

pub use pattern::{Fingerprint, PatternDetector, PatternKind, PatternMatch};
pub use queue::{Enqueued, PendingSignal, SignalQueue};
pub use trend::{resample, Trend, TrendFilter};
