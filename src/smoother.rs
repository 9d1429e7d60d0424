//! GPS sample smoothing.
//!
//! Consumer GPS on a moving worker produces jitter, multipath glitches and
//! occasional teleportation. The smoother rejects implausible fixes and
//! produces a weighted-average position over a small sliding window, so the
//! resolver downstream sees physically sane movement.
//!
//! Rejected fixes never surface as errors: the smoother keeps returning the
//! last valid output unchanged.

use std::collections::VecDeque;

use log::debug;

use crate::geo_utils::haversine_distance;
use crate::types::{RawFix, SmoothedPosition};

/// Configuration for the sample smoother.
#[derive(Debug, Clone)]
pub struct SmootherConfig {
    /// Sliding window capacity.
    /// Default: 5
    pub window_size: usize,

    /// Fixes with reported accuracy above this are rejected once a prior
    /// valid position exists. The first-ever fix is kept regardless, so a
    /// session starting under poor sky still produces a position.
    /// Default: 100.0 meters
    pub max_accuracy_meters: f64,

    /// Implied speed above which a large jump is treated as a GPS glitch.
    /// Generous ceiling for on-foot and hi-rail movement.
    /// Default: 33.0 m/s
    pub max_plausible_speed_mps: f64,

    /// Minimum jump distance for the glitch check to apply; small jumps are
    /// always accepted even at high implied speed (timestamps may be close).
    /// Default: 100.0 meters
    pub min_jump_meters: f64,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            max_accuracy_meters: 100.0,
            max_plausible_speed_mps: 33.0,
            min_jump_meters: 100.0,
        }
    }
}

/// Sliding-window weighted-average smoother over raw GPS fixes.
///
/// Each accepted sample's weight is the product of a recency factor (linear
/// rank in the window) and an inverse-accuracy factor, so both staleness and
/// poor accuracy degrade influence smoothly. Speed and heading are
/// instantaneous quantities and are taken from the latest sample unaveraged.
#[derive(Debug)]
pub struct SampleSmoother {
    config: SmootherConfig,
    window: VecDeque<RawFix>,
    last_output: Option<SmoothedPosition>,
}

impl SampleSmoother {
    pub fn new(config: SmootherConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            last_output: None,
        }
    }

    /// Feed one raw fix. Returns the current best position: either a fresh
    /// weighted average, or the prior output unchanged when the fix was
    /// rejected. `None` only before any valid fix has ever been seen.
    pub fn smooth(&mut self, raw: RawFix) -> Option<SmoothedPosition> {
        if !self.accept(&raw) {
            return self.last_output;
        }

        if self.window.len() == self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(raw);

        let output = self.weighted_average(raw);
        self.last_output = Some(output);
        self.last_output
    }

    /// Last valid output without feeding a new fix.
    pub fn last_position(&self) -> Option<SmoothedPosition> {
        self.last_output
    }

    /// Number of samples currently in the window.
    pub fn sample_count(&self) -> usize {
        self.window.len()
    }

    /// Clear the window and last output. Called when a new authority/session
    /// starts so positions are never blended across sessions.
    pub fn reset(&mut self) {
        self.window.clear();
        self.last_output = None;
    }

    fn accept(&self, raw: &RawFix) -> bool {
        if !raw.has_valid_coordinates() {
            debug!("[SampleSmoother] Rejected fix: coordinates out of range");
            return false;
        }
        if raw.accuracy_meters <= 0.0 {
            debug!(
                "[SampleSmoother] Rejected fix: invalid accuracy {:.1}m",
                raw.accuracy_meters
            );
            return false;
        }
        // Poor accuracy is tolerated only as the first-ever sample.
        if raw.accuracy_meters > self.config.max_accuracy_meters && self.last_output.is_some() {
            debug!(
                "[SampleSmoother] Rejected fix: accuracy {:.1}m exceeds {:.1}m",
                raw.accuracy_meters, self.config.max_accuracy_meters
            );
            return false;
        }

        if let Some(last) = &self.last_output {
            let jump_m = haversine_distance(
                last.latitude,
                last.longitude,
                raw.latitude,
                raw.longitude,
            );
            let dt_s = (raw.timestamp - last.timestamp).num_milliseconds() as f64 / 1000.0;
            if jump_m > self.config.min_jump_meters {
                // Non-positive dt means out-of-order delivery; treat the jump
                // as instantaneous.
                let implied_speed = if dt_s > 0.0 { jump_m / dt_s } else { f64::MAX };
                if implied_speed > self.config.max_plausible_speed_mps {
                    debug!(
                        "[SampleSmoother] Rejected fix: {:.0}m jump at {:.0} m/s implied speed",
                        jump_m, implied_speed
                    );
                    return false;
                }
            }
        }

        true
    }

    fn weighted_average(&self, latest: RawFix) -> SmoothedPosition {
        let count = self.window.len();

        let mut total_weight = 0.0;
        let mut lat_sum = 0.0;
        let mut lon_sum = 0.0;
        let mut alt_sum = 0.0;
        let mut alt_weight = 0.0;

        for (i, fix) in self.window.iter().enumerate() {
            let recency = (i + 1) as f64;
            let weight = recency * (1.0 / fix.accuracy_meters);
            total_weight += weight;
            lat_sum += fix.latitude * weight;
            lon_sum += fix.longitude * weight;
            if let Some(alt) = fix.altitude {
                alt_sum += alt * weight;
                alt_weight += weight;
            }
        }

        SmoothedPosition {
            latitude: lat_sum / total_weight,
            longitude: lon_sum / total_weight,
            altitude: if alt_weight > 0.0 {
                Some(alt_sum / alt_weight)
            } else {
                None
            },
            accuracy_meters: latest.accuracy_meters,
            speed_mps: latest.speed_mps,
            heading_degrees: latest.heading_degrees,
            timestamp: latest.timestamp,
            smoothed: count > 1,
            sample_count: count as u32,
        }
    }
}

impl Default for SampleSmoother {
    fn default() -> Self {
        Self::new(SmootherConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn fix_at(lat: f64, lon: f64, accuracy: f64, offset_secs: i64) -> RawFix {
        RawFix {
            latitude: lat,
            longitude: lon,
            altitude: None,
            accuracy_meters: accuracy,
            speed_mps: 1.5,
            heading_degrees: 45.0,
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
                + Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn test_first_fix_passes_through() {
        let mut smoother = SampleSmoother::default();
        let out = smoother.smooth(fix_at(40.0, -100.0, 8.0, 0)).unwrap();
        assert_eq!(out.latitude, 40.0);
        assert_eq!(out.longitude, -100.0);
        assert_eq!(out.sample_count, 1);
        assert!(!out.smoothed);
    }

    #[test]
    fn test_invalid_accuracy_keeps_last_output() {
        let mut smoother = SampleSmoother::default();
        let first = smoother.smooth(fix_at(40.0, -100.0, 8.0, 0)).unwrap();

        let out = smoother.smooth(fix_at(40.001, -100.0, 0.0, 1)).unwrap();
        assert_eq!(out, first);

        let out = smoother.smooth(fix_at(40.001, -100.0, -4.0, 2)).unwrap();
        assert_eq!(out, first);
    }

    #[test]
    fn test_invalid_accuracy_before_any_fix_yields_none() {
        let mut smoother = SampleSmoother::default();
        assert!(smoother.smooth(fix_at(40.0, -100.0, 0.0, 0)).is_none());
    }

    #[test]
    fn test_poor_accuracy_kept_only_as_first_sample() {
        let mut smoother = SampleSmoother::default();
        // 150m accuracy with no prior position: kept.
        let out = smoother.smooth(fix_at(40.0, -100.0, 150.0, 0)).unwrap();
        assert_eq!(out.sample_count, 1);

        // Same accuracy with a prior position: rejected.
        let out = smoother.smooth(fix_at(40.0005, -100.0, 150.0, 1)).unwrap();
        assert_eq!(out.sample_count, 1);
        assert_eq!(out.latitude, 40.0);
    }

    #[test]
    fn test_teleport_rejected() {
        let mut smoother = SampleSmoother::default();
        let first = smoother.smooth(fix_at(40.0, -100.0, 8.0, 0)).unwrap();

        // ~1.1km away one second later: implied ~1100 m/s.
        let out = smoother.smooth(fix_at(40.01, -100.0, 8.0, 1)).unwrap();
        assert_eq!(out.latitude, first.latitude);
        assert_eq!(out.sample_count, 1);
    }

    #[test]
    fn test_large_jump_at_plausible_speed_accepted() {
        let mut smoother = SampleSmoother::default();
        smoother.smooth(fix_at(40.0, -100.0, 8.0, 0)).unwrap();

        // ~1.1km in 60s is ~18 m/s: a hi-rail vehicle, not a glitch.
        let out = smoother.smooth(fix_at(40.01, -100.0, 8.0, 60)).unwrap();
        assert_eq!(out.sample_count, 2);
        assert!(out.latitude > 40.0);
    }

    #[test]
    fn test_output_within_convex_hull_of_window() {
        let mut smoother = SampleSmoother::default();
        let lats = [40.0000, 40.0002, 40.0001, 40.0004, 40.0003];
        let mut last = None;
        for (i, lat) in lats.iter().enumerate() {
            last = smoother.smooth(fix_at(*lat, -100.0, 10.0, i as i64 * 5));
        }
        let out = last.unwrap();
        assert!(out.latitude >= 40.0000 && out.latitude <= 40.0004);
        assert_eq!(out.longitude, -100.0);
        assert_eq!(out.sample_count, 5);
        assert!(out.smoothed);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut smoother = SampleSmoother::default();
        for i in 0..20 {
            smoother.smooth(fix_at(40.0 + i as f64 * 1e-5, -100.0, 10.0, i * 5));
        }
        assert_eq!(smoother.sample_count(), 5);
    }

    #[test]
    fn test_accurate_samples_dominate_average() {
        let mut smoother = SampleSmoother::default();
        smoother.smooth(fix_at(40.0000, -100.0, 50.0, 0));
        let out = smoother.smooth(fix_at(40.0004, -100.0, 5.0, 5)).unwrap();
        // Latest sample is both more recent and 10x more accurate.
        assert!(out.latitude > 40.0003, "got {}", out.latitude);
    }

    #[test]
    fn test_speed_and_heading_from_latest_sample() {
        let mut smoother = SampleSmoother::default();
        let mut a = fix_at(40.0, -100.0, 10.0, 0);
        a.speed_mps = 1.0;
        a.heading_degrees = 10.0;
        smoother.smooth(a);

        let mut b = fix_at(40.0001, -100.0, 10.0, 5);
        b.speed_mps = 3.0;
        b.heading_degrees = 200.0;
        let out = smoother.smooth(b).unwrap();
        assert_eq!(out.speed_mps, 3.0);
        assert_eq!(out.heading_degrees, 200.0);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut smoother = SampleSmoother::default();
        smoother.smooth(fix_at(40.0, -100.0, 8.0, 0));
        smoother.reset();
        assert_eq!(smoother.sample_count(), 0);
        assert!(smoother.last_position().is_none());
    }
}
