//! W/M reversal pattern detection
//!
//! A W (double bottom) is two swing troughs within a price tolerance of each
//! other, separated by a minimum candle distance, confirmed when a later
//! candle closes above the neckline (the highest high between the troughs).
//! An M (double top) is the mirror image.
//!
//! `detect` only ever sees a `CandleSeries` — closed candles by type — and
//! reports a match only on the candle that first closes beyond the neckline.
//! Re-running on the same series is therefore idempotent, and decisions made
//! at candle N cannot change when candles after N arrive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StrategyParams;
use crate::types::{Candle, CandleSeries, Direction};

/// Pattern shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternKind {
    /// Double bottom, resolves long
    W,
    /// Double top, resolves short
    M,
}

impl PatternKind {
    pub fn direction(&self) -> Direction {
        match self {
            PatternKind::W => Direction::Long,
            PatternKind::M => Direction::Short,
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternKind::W => write!(f, "W"),
            PatternKind::M => write!(f, "M"),
        }
    }
}

/// Deterministic pattern identity used for signal deduplication:
/// kind + anchor (second extreme) open_time + direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(kind: PatternKind, anchor: DateTime<Utc>, direction: Direction) -> Self {
        Self(format!("{}:{}:{}", kind, anchor.timestamp_millis(), direction))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A confirmed reversal pattern
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub kind: PatternKind,
    pub direction: Direction,
    pub fingerprint: Fingerprint,
    /// Open time of the second trough/peak
    pub anchor_time: DateTime<Utc>,
    pub neckline: f64,
    /// Close of the confirming breakout candle
    pub breakout_close: f64,
    /// Open time of the confirming candle
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwingKind {
    Trough,
    Peak,
}

#[derive(Debug, Clone, Copy)]
struct SwingPoint {
    kind: SwingKind,
    /// Index into the scanned window
    index: usize,
    price: f64,
}

/// Stateless W/M detector over a trailing window of closed candles.
#[derive(Debug, Clone)]
pub struct PatternDetector {
    swing_window: usize,
    tolerance: f64,
    min_separation: usize,
    lookback: usize,
}

impl PatternDetector {
    pub fn new(params: &StrategyParams) -> Self {
        Self {
            swing_window: params.swing_window,
            tolerance: params.pattern_tolerance,
            min_separation: params.min_separation,
            lookback: params.pattern_lookback,
        }
    }

    /// Scan the trailing window and report a pattern newly confirmed by the
    /// most recent closed candle. When overlapping candidates exist, the one
    /// with the most recent second extreme wins.
    pub fn detect(&self, series: &CandleSeries) -> Option<PatternMatch> {
        let window = series.tail(self.lookback);
        if window.len() < self.swing_window * 2 + 3 {
            return None;
        }

        let swings = self.extract_swings(window);
        let last_idx = window.len() - 1;

        // A W and an M cannot both be confirmed by the same candle (the
        // close cannot be above one neckline and below the other side's)
        self.match_pair(window, &swings, SwingKind::Trough, last_idx)
            .or_else(|| self.match_pair(window, &swings, SwingKind::Peak, last_idx))
    }

    /// A swing point is a strict local extreme over `swing_window` candles on
    /// each side, so it is only knowable `swing_window` candles after the
    /// fact. Scanning stops early enough that every reported swing is final.
    fn extract_swings(&self, window: &[Candle]) -> Vec<SwingPoint> {
        let k = self.swing_window;
        let mut swings = Vec::new();

        for i in k..window.len().saturating_sub(k) {
            let is_trough = (i - k..=i + k)
                .filter(|&j| j != i)
                .all(|j| window[j].low > window[i].low);
            if is_trough {
                swings.push(SwingPoint {
                    kind: SwingKind::Trough,
                    index: i,
                    price: window[i].low,
                });
                continue;
            }
            let is_peak = (i - k..=i + k)
                .filter(|&j| j != i)
                .all(|j| window[j].high < window[i].high);
            if is_peak {
                swings.push(SwingPoint {
                    kind: SwingKind::Peak,
                    index: i,
                    price: window[i].high,
                });
            }
        }
        swings
    }

    fn match_pair(
        &self,
        window: &[Candle],
        swings: &[SwingPoint],
        kind: SwingKind,
        last_idx: usize,
    ) -> Option<PatternMatch> {
        let extremes: Vec<&SwingPoint> = swings.iter().filter(|s| s.kind == kind).collect();
        if extremes.len() < 2 {
            return None;
        }

        // Latest second extreme first: most recently confirmed wins
        for (second_pos, second) in extremes.iter().enumerate().skip(1).rev() {
            for first in extremes[..second_pos].iter().rev() {
                if second.index - first.index < self.min_separation {
                    continue;
                }
                let diff = (second.price - first.price).abs() / first.price;
                if diff >= self.tolerance {
                    continue;
                }

                let between = &window[first.index + 1..second.index];
                if between.is_empty() {
                    continue;
                }
                let (neckline, pattern_kind) = match kind {
                    SwingKind::Trough => (
                        between.iter().map(|c| c.high).fold(f64::MIN, f64::max),
                        PatternKind::W,
                    ),
                    SwingKind::Peak => (
                        between.iter().map(|c| c.low).fold(f64::MAX, f64::min),
                        PatternKind::M,
                    ),
                };

                if !self.newly_broken(window, second.index, neckline, pattern_kind, last_idx) {
                    continue;
                }

                let direction = pattern_kind.direction();
                let anchor_time = window[second.index].open_time;
                return Some(PatternMatch {
                    kind: pattern_kind,
                    direction,
                    fingerprint: Fingerprint::new(pattern_kind, anchor_time, direction),
                    anchor_time,
                    neckline,
                    breakout_close: window[last_idx].close,
                    confirmed_at: window[last_idx].open_time,
                });
            }
        }
        None
    }

    /// True when the most recent candle is the FIRST close beyond the
    /// neckline since the second extreme. Earlier breakouts were reported on
    /// their own candle; re-reporting them here would double-signal.
    fn newly_broken(
        &self,
        window: &[Candle],
        second_idx: usize,
        neckline: f64,
        kind: PatternKind,
        last_idx: usize,
    ) -> bool {
        if last_idx <= second_idx {
            return false;
        }
        let beyond = |c: &Candle| match kind {
            PatternKind::W => c.close > neckline,
            PatternKind::M => c.close < neckline,
        };
        if !beyond(&window[last_idx]) {
            return false;
        }
        !window[second_idx + 1..last_idx].iter().any(beyond)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;
    use chrono::{TimeZone, Utc};

    fn candle(i: usize, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: Utc.timestamp_opt(i as i64 * 3600, 0).unwrap(),
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn detector() -> PatternDetector {
        let params = StrategyParams {
            swing_window: 2,
            pattern_tolerance: 0.03,
            min_separation: 3,
            pattern_lookback: 120,
            ..Default::default()
        };
        PatternDetector::new(&params)
    }

    /// Closes trace a W: down to 90, bounce to 95.5 neckline, down to ~90,
    /// breakout close above the neckline on the last candle.
    fn w_candles() -> Vec<Candle> {
        vec![
            candle(0, 100.5, 99.5, 100.0),
            candle(1, 98.5, 97.5, 98.0),
            candle(2, 96.5, 95.5, 96.0),
            candle(3, 94.5, 93.5, 94.0),
            candle(4, 90.5, 89.5, 90.0), // first trough
            candle(5, 93.5, 92.5, 93.0),
            candle(6, 95.5, 94.5, 95.0), // neckline high 95.5
            candle(7, 93.5, 92.5, 93.0),
            candle(8, 90.9, 89.9, 90.4), // second trough, 0.45% from first
            candle(9, 92.5, 91.5, 92.0),
            candle(10, 94.5, 93.5, 94.0),
            candle(11, 96.5, 95.0, 96.0), // breakout close 96.0 > 95.5
        ]
    }

    #[test]
    fn detects_double_bottom_on_breakout_candle() {
        let series = CandleSeries::from_candles(Timeframe::H1, w_candles()).unwrap();
        let m = detector().detect(&series).expect("W should confirm");
        assert_eq!(m.kind, PatternKind::W);
        assert_eq!(m.direction, Direction::Long);
        assert!((m.neckline - 95.5).abs() < 1e-12);
        assert_eq!(m.anchor_time, Utc.timestamp_opt(8 * 3600, 0).unwrap());
    }

    #[test]
    fn no_match_before_breakout() {
        let mut candles = w_candles();
        candles.truncate(11); // stop before the breakout candle
        let series = CandleSeries::from_candles(Timeframe::H1, candles).unwrap();
        assert!(detector().detect(&series).is_none());
    }

    #[test]
    fn tolerance_rejects_unequal_troughs() {
        let mut candles = w_candles();
        // Second trough 10% below the first: not a double bottom
        candles[8] = candle(8, 82.0, 81.0, 81.5);
        // Keep swing structure intact around index 8
        candles[9] = candle(9, 85.0, 84.0, 84.5);
        let series = CandleSeries::from_candles(Timeframe::H1, candles).unwrap();
        assert!(detector().detect(&series).is_none());
    }

    #[test]
    fn breakout_reported_only_once() {
        let mut candles = w_candles();
        // One more candle above the neckline after the breakout
        candles.push(candle(12, 97.5, 96.5, 97.0));
        let series = CandleSeries::from_candles(Timeframe::H1, candles).unwrap();
        // The breakout happened at index 11; index 12 must not re-report it
        assert!(detector().detect(&series).is_none());
    }

    #[test]
    fn detects_double_top() {
        let candles: Vec<Candle> = vec![
            candle(0, 99.5, 98.5, 99.0),
            candle(1, 101.5, 100.5, 101.0),
            candle(2, 103.5, 102.5, 103.0),
            candle(3, 105.5, 104.5, 105.0),
            candle(4, 110.5, 109.5, 110.0), // first peak
            candle(5, 107.5, 106.5, 107.0),
            candle(6, 105.5, 104.5, 105.0), // neckline low 104.5
            candle(7, 107.5, 106.5, 107.0),
            candle(8, 110.1, 109.1, 109.6), // second peak, 0.36% from first
            candle(9, 108.5, 107.5, 108.0),
            candle(10, 106.5, 105.5, 106.0),
            candle(11, 105.0, 103.5, 104.0), // close 104.0 < 104.5
        ];
        let series = CandleSeries::from_candles(Timeframe::H1, candles).unwrap();
        let m = detector().detect(&series).expect("M should confirm");
        assert_eq!(m.kind, PatternKind::M);
        assert_eq!(m.direction, Direction::Short);
        assert!((m.neckline - 104.5).abs() < 1e-12);
    }

    #[test]
    fn fingerprint_is_stable_across_redetection() {
        let series = CandleSeries::from_candles(Timeframe::H1, w_candles()).unwrap();
        let d = detector();
        let a = d.detect(&series).unwrap();
        let b = d.detect(&series).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
    }
}
