use serde::{Deserialize, Serialize};

use crate::waveform::DataExtent;

use super::zoom_history::ZoomState;

const MAX_RATIO: f64 = 0.95;
pub const DEFAULT_TRIGGER_THRESHOLD: f64 = 0.25;
pub const DEFAULT_RIGHT_PADDING: f64 = 0.65;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoPanConfig {
    pub enabled: bool,
    /// Fraction of the visible width, measured from the right edge, inside
    /// which a committed event end triggers a pan.
    pub trigger_threshold: f64,
    /// Fraction of the visible width left empty right of the event end
    /// after panning.
    pub right_padding: f64,
}

impl Default for AutoPanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_threshold: DEFAULT_TRIGGER_THRESHOLD,
            right_padding: DEFAULT_RIGHT_PADDING,
        }
    }
}

/// Clamps a ratio into `[0, 0.95]`; non-finite input falls back to
/// `fallback`.
pub fn clamp_ratio(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, MAX_RATIO)
    } else {
        fallback
    }
}

impl AutoPanConfig {
    pub fn new(enabled: bool, trigger_threshold: f64, right_padding: f64) -> Self {
        Self {
            enabled,
            trigger_threshold: clamp_ratio(trigger_threshold, DEFAULT_TRIGGER_THRESHOLD),
            right_padding: clamp_ratio(right_padding, DEFAULT_RIGHT_PADDING),
        }
    }
}

/// Window to move to after an event grew to `event_end`, or `None` when
/// the end is not near the right edge. The visible width is kept and the
/// result is clamped to `extent`.
pub fn compute_auto_pan(
    current: &ZoomState,
    event_end: f64,
    extent: Option<DataExtent>,
    config: &AutoPanConfig,
) -> Option<ZoomState> {
    if !config.enabled || !event_end.is_finite() {
        return None;
    }
    let width = current.width();
    if width.is_nan() || width <= 0.0 {
        return None;
    }

    let trigger_at = current.x_max - width * config.trigger_threshold;
    if event_end < trigger_at {
        return None;
    }

    let mut x_max = event_end + width * config.right_padding;
    let mut x_min = x_max - width;
    if let Some(extent) = extent {
        let full = extent.x_max - extent.x_min;
        if width >= full {
            x_min = extent.x_min;
            x_max = extent.x_max;
        } else if x_max > extent.x_max {
            x_max = extent.x_max;
            x_min = x_max - width;
        } else if x_min < extent.x_min {
            x_min = extent.x_min;
            x_max = x_min + width;
        }
    }

    let next = ZoomState::new(x_min, x_max, current.y_min, current.y_max);
    if next.same_window(current) {
        return None;
    }
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(x_min: f64, x_max: f64) -> ZoomState {
        ZoomState::new(x_min, x_max, -1.0, 1.0)
    }

    fn extent(x_max: f64) -> Option<DataExtent> {
        Some(DataExtent {
            x_min: 0.0,
            x_max,
            y_min: -1.0,
            y_max: 1.0,
        })
    }

    #[test]
    fn ignores_end_far_from_right_edge() {
        let config = AutoPanConfig::default();
        assert_eq!(compute_auto_pan(&view(0.0, 10.0), 5.0, extent(100.0), &config), None);
    }

    #[test]
    fn pans_so_end_sits_at_padding() {
        let config = AutoPanConfig::default();
        let next = compute_auto_pan(&view(0.0, 10.0), 8.0, extent(100.0), &config).unwrap();
        assert!((next.x_max - 14.5).abs() < 1e-9);
        assert!((next.x_min - 4.5).abs() < 1e-9);
        assert_eq!((next.y_min, next.y_max), (-1.0, 1.0));
    }

    #[test]
    fn clamps_to_data_extent() {
        let config = AutoPanConfig::default();
        let next = compute_auto_pan(&view(80.0, 90.0), 89.0, extent(92.0), &config).unwrap();
        assert_eq!((next.x_min, next.x_max), (82.0, 92.0));
        assert_eq!(compute_auto_pan(&next, 91.5, extent(92.0), &config), None);
    }

    #[test]
    fn disabled_or_degenerate_never_pans() {
        let off = AutoPanConfig::new(false, 0.25, 0.65);
        assert_eq!(compute_auto_pan(&view(0.0, 10.0), 9.9, None, &off), None);
        let on = AutoPanConfig::default();
        assert_eq!(compute_auto_pan(&view(5.0, 5.0), 5.0, None, &on), None);
    }

    #[test]
    fn ratios_are_clamped() {
        let config = AutoPanConfig::new(true, 2.0, f64::NAN);
        assert_eq!(config.trigger_threshold, 0.95);
        assert_eq!(config.right_padding, DEFAULT_RIGHT_PADDING);
        assert_eq!(clamp_ratio(-0.3, 0.25), 0.0);
    }
}
