//! Waveform samples as seen by the annotation core: only the timestamp axis
//! matters for snapping and clamping boundaries, amplitudes feed the initial
//! viewport.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::models::TrialKey;

#[async_trait]
pub trait WaveformSource: Send + Sync {
    async fn fetch(&self, key: &TrialKey) -> Result<Waveform>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Waveform {
    /// Monotonic sample timestamps.
    pub timestamps: Vec<f64>,
    pub raw: Vec<f64>,
    pub filtered: Vec<f64>,
}

/// Full data range of a waveform, used to clamp viewports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataExtent {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl Waveform {
    pub fn new(timestamps: Vec<f64>, raw: Vec<f64>, filtered: Vec<f64>) -> Self {
        Self {
            timestamps,
            raw,
            filtered,
        }
    }

    /// Evenly spaced samples, mostly for tests and synthetic trials.
    pub fn uniform(sample_count: usize, sample_interval: f64) -> Self {
        let timestamps: Vec<f64> = (0..sample_count)
            .map(|i| i as f64 * sample_interval)
            .collect();
        let raw = vec![0.0; sample_count];
        let filtered = raw.clone();
        Self::new(timestamps, raw, filtered)
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn last_index(&self) -> usize {
        self.timestamps.len().saturating_sub(1)
    }

    pub fn time_at(&self, index: usize) -> Option<f64> {
        self.timestamps.get(index).copied()
    }

    /// Index of the sample nearest to `time`, ties going to the earlier one.
    pub fn snap(&self, time: f64) -> Option<usize> {
        if self.timestamps.is_empty() || !time.is_finite() {
            return None;
        }
        let upper = self.timestamps.partition_point(|&t| t < time);
        if upper == 0 {
            return Some(0);
        }
        if upper >= self.timestamps.len() {
            return Some(self.last_index());
        }
        let before = time - self.timestamps[upper - 1];
        let after = self.timestamps[upper] - time;
        Some(if after < before { upper } else { upper - 1 })
    }

    pub fn extent(&self) -> Option<DataExtent> {
        let x_min = *self.timestamps.first()?;
        let x_max = *self.timestamps.last()?;
        let (y_min, y_max) = self
            .raw
            .iter()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let (y_min, y_max) = if y_min.is_finite() {
            (y_min, y_max)
        } else {
            (0.0, 0.0)
        };
        Some(DataExtent {
            x_min,
            x_max,
            y_min,
            y_max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snap_picks_nearest_sample() {
        let waveform = Waveform::uniform(11, 0.1);
        assert_eq!(waveform.snap(-3.0), Some(0));
        assert_eq!(waveform.snap(0.26), Some(3));
        assert_eq!(waveform.snap(0.24), Some(2));
        assert_eq!(waveform.snap(99.0), Some(10));
        assert_eq!(waveform.snap(f64::NAN), None);
    }

    #[test]
    fn extent_covers_raw_amplitudes() {
        let waveform = Waveform::new(vec![0.0, 1.0, 2.0], vec![-2.0, 5.0, 1.0], vec![0.0; 3]);
        let extent = waveform.extent().unwrap();
        assert_eq!((extent.x_min, extent.x_max), (0.0, 2.0));
        assert_eq!((extent.y_min, extent.y_max), (-2.0, 5.0));
        assert!(Waveform::default().extent().is_none());
    }
}
