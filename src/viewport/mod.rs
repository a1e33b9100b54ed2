//! Waveform viewport: initial window, zoom history and auto-pan after
//! committed segments.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::waveform::DataExtent;
use crate::{log_debug, log_info};

pub mod auto_pan;
pub mod zoom_history;

pub use auto_pan::{compute_auto_pan, AutoPanConfig};
pub use zoom_history::{ZoomHistory, ZoomState, MAX_UNDO_STATES};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "phasemark::viewport";

/// First window for a freshly loaded waveform. X starts at the left edge of
/// the data and spans `1 / zoom_x` of it; Y is centered on the data
/// midpoint. A factor of 1 or less shows the full range.
pub fn initial_viewport(extent: DataExtent, zoom_x: f64, zoom_y: f64) -> ZoomState {
    let x_full = nonzero_span(extent.x_max - extent.x_min);
    let y_full = nonzero_span(extent.y_max - extent.y_min);
    let x_span = if zoom_x > 1.0 { x_full / zoom_x } else { x_full };
    let y_span = if zoom_y > 1.0 { y_full / zoom_y } else { y_full };

    let (x_min, x_max) = fit_span(
        (extent.x_min, extent.x_min + x_span),
        extent.x_min,
        extent.x_max,
    );
    let y_center = (extent.y_min + extent.y_max) / 2.0;
    let (y_min, y_max) = fit_span(
        (y_center - y_span / 2.0, y_center + y_span / 2.0),
        extent.y_min,
        extent.y_max,
    );
    ZoomState::new(x_min, x_max, y_min, y_max)
}

fn nonzero_span(span: f64) -> f64 {
    if span == 0.0 || !span.is_finite() {
        1.0
    } else {
        span
    }
}

/// Shifts `(lo, hi)` inside `[min, max]` keeping its width. A flat extent
/// leaves the window where it is.
fn fit_span((mut lo, mut hi): (f64, f64), min: f64, max: f64) -> (f64, f64) {
    let full = max - min;
    if full.is_nan() || full <= 0.0 {
        return (lo, hi);
    }
    let span = hi - lo;
    if span > full {
        return (min, max);
    }
    if lo < min {
        lo = min;
        hi = min + span;
    }
    if hi > max {
        hi = max;
        lo = max - span;
    }
    (lo, hi)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportSnapshot {
    pub current: Option<ZoomState>,
    pub can_undo: bool,
    pub can_redo: bool,
    pub history_len: usize,
}

struct ViewportState {
    history: Option<ZoomHistory>,
    extent: Option<DataExtent>,
    auto_pan: AutoPanConfig,
}

/// Viewport of the trial on screen. Empty until a waveform is shown.
#[derive(Clone)]
pub struct ViewportController {
    state: Arc<Mutex<ViewportState>>,
}

impl ViewportController {
    pub fn new(auto_pan: AutoPanConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(ViewportState {
                history: None,
                extent: None,
                auto_pan,
            })),
        }
    }

    /// Starts a fresh history for a newly loaded waveform.
    pub async fn init(&self, extent: DataExtent, zoom_x: f64, zoom_y: f64) -> ZoomState {
        let initial = initial_viewport(extent, zoom_x, zoom_y);
        let mut state = self.state.lock().await;
        state.history = Some(ZoomHistory::new(initial));
        state.extent = Some(extent);
        log_debug!("Initial viewport {:?}", initial);
        initial
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.history = None;
        state.extent = None;
    }

    pub async fn set_auto_pan(&self, config: AutoPanConfig) {
        self.state.lock().await.auto_pan = config;
    }

    pub async fn current(&self) -> Option<ZoomState> {
        let state = self.state.lock().await;
        state.history.as_ref().map(ZoomHistory::current)
    }

    pub async fn snapshot(&self) -> ViewportSnapshot {
        let state = self.state.lock().await;
        match &state.history {
            Some(history) => ViewportSnapshot {
                current: Some(history.current()),
                can_undo: history.can_undo(),
                can_redo: history.can_redo(),
                history_len: history.len(),
            },
            None => ViewportSnapshot {
                current: None,
                can_undo: false,
                can_redo: false,
                history_len: 0,
            },
        }
    }

    /// Records a user zoom or pan. Ignored until a waveform is shown.
    pub async fn set_zoom(&self, zoom: ZoomState) -> bool {
        let mut state = self.state.lock().await;
        match state.history.as_mut() {
            Some(history) => {
                history.push(zoom);
                true
            }
            None => false,
        }
    }

    pub async fn undo(&self) -> Option<ZoomState> {
        let mut state = self.state.lock().await;
        state.history.as_mut().and_then(ZoomHistory::undo)
    }

    pub async fn redo(&self) -> Option<ZoomState> {
        let mut state = self.state.lock().await;
        state.history.as_mut().and_then(ZoomHistory::redo)
    }

    pub async fn reset(&self) -> Option<ZoomState> {
        let mut state = self.state.lock().await;
        state.history.as_mut().map(ZoomHistory::reset)
    }

    /// Follows a committed segment. A pan is pushed as a regular history
    /// entry and returned.
    pub async fn follow_event_end(&self, event_end: f64) -> Option<ZoomState> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let history = state.history.as_mut()?;
        let next = compute_auto_pan(&history.current(), event_end, state.extent, &state.auto_pan)?;
        history.push(next);
        log_info!("Auto-panned to [{:.3}, {:.3}]", next.x_min, next.x_max);
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent() -> DataExtent {
        DataExtent {
            x_min: 0.0,
            x_max: 100.0,
            y_min: -4.0,
            y_max: 6.0,
        }
    }

    #[test]
    fn initial_view_starts_left_and_centers_y() {
        let view = initial_viewport(extent(), 4.0, 2.0);
        assert_eq!((view.x_min, view.x_max), (0.0, 25.0));
        assert_eq!((view.y_min, view.y_max), (-1.5, 3.5));
    }

    #[test]
    fn factor_at_most_one_shows_everything() {
        let view = initial_viewport(extent(), 1.0, 0.5);
        assert_eq!((view.x_min, view.x_max), (0.0, 100.0));
        assert_eq!((view.y_min, view.y_max), (-4.0, 6.0));
    }

    #[test]
    fn flat_signal_gets_unit_height() {
        let flat = DataExtent {
            x_min: 0.0,
            x_max: 10.0,
            y_min: 0.0,
            y_max: 0.0,
        };
        let view = initial_viewport(flat, 1.0, 1.0);
        assert_eq!((view.y_min, view.y_max), (-0.5, 0.5));
        assert_eq!((view.x_min, view.x_max), (0.0, 10.0));
    }

    #[tokio::test]
    async fn auto_pan_counts_as_history_entry() {
        let viewport = ViewportController::new(AutoPanConfig::default());
        assert_eq!(viewport.follow_event_end(5.0).await, None);

        viewport.init(extent(), 10.0, 1.0).await;
        assert_eq!(viewport.follow_event_end(3.0).await, None);
        let panned = viewport.follow_event_end(9.0).await.unwrap();
        assert!((panned.x_max - 15.5).abs() < 1e-9);

        let snapshot = viewport.snapshot().await;
        assert_eq!(snapshot.history_len, 2);
        assert!(snapshot.can_undo);

        let back = viewport.undo().await.unwrap();
        assert_eq!((back.x_min, back.x_max), (0.0, 10.0));
        assert_eq!(viewport.redo().await, Some(panned));
    }

    #[tokio::test]
    async fn zoom_is_ignored_before_init() {
        let viewport = ViewportController::new(AutoPanConfig::default());
        assert!(!viewport.set_zoom(ZoomState::new(0.0, 1.0, 0.0, 1.0)).await);
        assert_eq!(viewport.reset().await, None);
    }
}
