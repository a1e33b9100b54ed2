//! Boundary capture: turns timeline clicks into phase segments.
//!
//! The machine is pure. `plan_click` validates a click against the current
//! state without touching it and `commit` applies an accepted plan, so a
//! caller that fails between the two (ownership, storage) leaves the
//! machine exactly where it was.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::{
    db::models::{Phase, Segment},
    error::ValidationError,
    waveform::Waveform,
};
use crate::{log_debug, log_warn};

use super::events::{event_segments, next_event_index};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "phasemark::capture";

/// A segment edge: continuous time plus the sample it sits on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Boundary {
    pub time: f64,
    pub index: usize,
}

/// Raw click from the chart. The index may be fractional or out of range;
/// it is floored and clamped when the segment is formed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundaryClick {
    pub time: f64,
    pub index: f64,
}

impl BoundaryClick {
    pub fn new(time: f64, index: f64) -> Self {
        Self { time, index }
    }

    /// Click at `time`, resolved to the nearest sample of `waveform`.
    pub fn snapped(time: f64, waveform: &Waveform) -> Self {
        let index = waveform.snap(time).map(|i| i as f64).unwrap_or(0.0);
        Self { time, index }
    }

    fn boundary(&self) -> Boundary {
        Boundary {
            time: self.time,
            index: self.index.max(0.0).floor() as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureStatus {
    Idle,
    AwaitingStart,
    AwaitingEnd,
}

/// Validated interval for the phase that was current when the click landed.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSpan {
    pub phase_id: String,
    pub phase_name: String,
    pub color: Option<String>,
    pub event_index: u32,
    pub start: Boundary,
    pub end: Boundary,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Cursor {
    phase_index: usize,
    event_index: u32,
    pending: Option<Boundary>,
    event_start: Option<Boundary>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClickPlan {
    /// First boundary of an event.
    Start(Boundary),
    Segment {
        span: SegmentSpan,
        /// The phase wrapped and the event holds a full set.
        completes_event: bool,
        next: CursorState,
    },
}

/// Opaque follow-up state carried by a plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorState(Cursor);

#[derive(Debug, Clone, Default)]
pub struct BoundaryCapture {
    annotating: bool,
    phase_index: usize,
    event_index: u32,
    pending: Option<Boundary>,
    event_start: Option<Boundary>,
}

impl BoundaryCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh machine for a newly loaded segment set: mode off, next event
    /// past every existing one.
    pub fn for_segments(segments: &[Segment]) -> Self {
        Self {
            event_index: next_event_index(segments),
            ..Self::default()
        }
    }

    pub fn status(&self) -> CaptureStatus {
        match (self.annotating, self.pending) {
            (false, _) => CaptureStatus::Idle,
            (true, None) => CaptureStatus::AwaitingStart,
            (true, Some(_)) => CaptureStatus::AwaitingEnd,
        }
    }

    pub fn is_annotating(&self) -> bool {
        self.annotating
    }

    pub fn phase_index(&self) -> usize {
        self.phase_index
    }

    pub fn event_index(&self) -> u32 {
        self.event_index
    }

    pub fn pending(&self) -> Option<Boundary> {
        self.pending
    }

    pub fn event_start(&self) -> Option<Boundary> {
        self.event_start
    }

    /// Turns annotation mode on, resuming the first event that is missing
    /// phases, else opening a new one.
    pub fn enable(&mut self, segments: &[Segment], phase_count: usize) -> Result<(), ValidationError> {
        if phase_count == 0 {
            return Err(ValidationError::NoPhases);
        }
        if self.annotating {
            return Ok(());
        }

        let event_indices: BTreeSet<u32> =
            segments.iter().map(|segment| segment.event_index).collect();
        let incomplete = event_indices
            .into_iter()
            .map(|event_index| (event_index, event_segments(segments, event_index)))
            .find(|(_, members)| members.len() < phase_count);

        match incomplete {
            Some((event_index, members)) => {
                let resume = members.last().map(|last| Boundary {
                    time: last.end_time,
                    index: last.end_index,
                });
                let start = members.first().map(|first| Boundary {
                    time: first.start_time,
                    index: first.start_index,
                });
                log_debug!(
                    "Resuming event {} at phase {} of {}",
                    event_index,
                    members.len(),
                    phase_count
                );
                self.event_index = event_index;
                self.phase_index = members.len().min(phase_count - 1);
                self.pending = resume;
                self.event_start = start.or(resume);
            }
            None => {
                self.event_index = next_event_index(segments);
                self.phase_index = 0;
                self.pending = None;
                self.event_start = None;
            }
        }
        self.annotating = true;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<(), ValidationError> {
        if self.pending.is_some() {
            return Err(ValidationError::PendingBoundary);
        }
        self.annotating = false;
        self.phase_index = 0;
        self.event_start = None;
        Ok(())
    }

    pub fn plan_click(
        &self,
        click: BoundaryClick,
        waveform: Option<&Waveform>,
        phases: &[Phase],
    ) -> Result<ClickPlan, ValidationError> {
        if !self.annotating {
            return Err(ValidationError::NotAnnotating);
        }
        if phases.is_empty() {
            return Err(ValidationError::NoPhases);
        }
        if !click.time.is_finite() || !click.index.is_finite() {
            log_warn!("Rejected click with non-finite values: {:?}", click);
            return Err(ValidationError::InvalidBoundary);
        }

        let Some(start) = self.pending else {
            return Ok(ClickPlan::Start(click.boundary()));
        };

        if click.time <= start.time {
            log_warn!(
                "Rejected end click at {} not after pending boundary {}",
                click.time,
                start.time
            );
            return Err(ValidationError::EndBeforeStart {
                start: start.time,
                end: click.time,
            });
        }

        let phase = phases
            .get(self.phase_index)
            .ok_or(ValidationError::NoPhases)?;

        let (start, end) = clamp_span(start, click, waveform)?;

        let completes_event = self.phase_index + 1 >= phases.len();
        let next = if completes_event {
            Cursor {
                phase_index: 0,
                event_index: self.event_index + 1,
                pending: None,
                event_start: None,
            }
        } else {
            Cursor {
                phase_index: self.phase_index + 1,
                event_index: self.event_index,
                pending: Some(click.boundary()),
                event_start: self.event_start,
            }
        };

        Ok(ClickPlan::Segment {
            span: SegmentSpan {
                phase_id: phase.id.clone(),
                phase_name: phase.name.clone(),
                color: Some(phase.color.clone()),
                event_index: self.event_index,
                start,
                end,
            },
            completes_event,
            next: CursorState(next),
        })
    }

    pub fn commit(&mut self, plan: &ClickPlan) {
        match plan {
            ClickPlan::Start(boundary) => {
                self.pending = Some(*boundary);
                self.event_start = Some(*boundary);
            }
            ClickPlan::Segment { next, .. } => {
                let cursor = next.0;
                self.phase_index = cursor.phase_index;
                self.event_index = cursor.event_index;
                self.pending = cursor.pending;
                self.event_start = cursor.event_start;
            }
        }
    }

    /// Clears the in-progress event after its segments were removed. Mode
    /// stays enabled.
    pub fn reset_flow(&mut self, next_event_index: u32) {
        self.phase_index = 0;
        self.event_index = next_event_index;
        self.pending = None;
        self.event_start = None;
    }

    /// Skips the current phase without creating a segment.
    pub fn advance_phase(&mut self, segments: &[Segment], phase_count: usize) -> Result<(), ValidationError> {
        if !self.annotating {
            return Err(ValidationError::NotAnnotating);
        }
        if phase_count == 0 {
            return Err(ValidationError::NoPhases);
        }

        let next_phase = (self.phase_index + 1) % phase_count;
        if next_phase == 0 {
            let highest = segments
                .iter()
                .map(|segment| segment.event_index)
                .fold(self.event_index, u32::max);
            self.event_index = highest + 1;
            self.phase_index = 0;
            self.pending = None;
            self.event_start = None;
            return Ok(());
        }

        let carried = segments
            .iter()
            .filter(|segment| segment.event_index == self.event_index)
            .max_by(|a, b| a.end_time.total_cmp(&b.end_time))
            .map(|last| Boundary {
                time: last.end_time,
                index: last.end_index,
            });
        self.phase_index = next_phase;
        if let Some(boundary) = carried {
            self.pending = Some(boundary);
            self.event_start = Some(boundary);
        }
        Ok(())
    }

    /// Returns false when no phase carries `key`.
    pub fn select_by_shortcut(&mut self, key: char, phases: &[Phase]) -> bool {
        match phases.iter().position(|phase| phase.matches_shortcut(key)) {
            Some(index) => {
                self.phase_index = index;
                true
            }
            None => false,
        }
    }

    pub fn set_phase_index(&mut self, index: usize, phase_count: usize) {
        self.phase_index = index.min(phase_count.saturating_sub(1));
    }
}

/// Floors and clamps both indices into the sample range, forcing at least
/// one sample of width, and snaps times onto the sample timestamps.
fn clamp_span(
    start: Boundary,
    click: BoundaryClick,
    waveform: Option<&Waveform>,
) -> Result<(Boundary, Boundary), ValidationError> {
    let timestamps = waveform.map(|w| w.timestamps.as_slice()).unwrap_or(&[]);
    let last_index = timestamps.len().saturating_sub(1);

    let start_index = start.index.min(last_index);
    let mut end_index = (click.index.max(0.0).floor() as usize).max(start_index + 1);

    if timestamps.is_empty() {
        return Ok((
            Boundary {
                time: start.time,
                index: start_index,
            },
            Boundary {
                time: click.time,
                index: end_index,
            },
        ));
    }

    end_index = end_index.min(last_index);
    if end_index <= start_index {
        end_index = (start_index + 1).min(last_index);
    }
    if end_index <= start_index {
        log_warn!(
            "Span collapsed after clamping: start {} end {} last {}",
            start_index,
            end_index,
            last_index
        );
        return Err(ValidationError::RangeTooSmall);
    }

    let start_time = timestamps[start_index];
    let end_time = timestamps[end_index];
    if end_time <= start_time {
        return Err(ValidationError::RangeTooSmall);
    }

    Ok((
        Boundary {
            time: start_time,
            index: start_index,
        },
        Boundary {
            time: end_time,
            index: end_index,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::events::fixtures::segment;

    fn abc() -> Vec<Phase> {
        vec![
            Phase::new("a", "A", "#111111", '1', 0),
            Phase::new("b", "B", "#222222", '2', 1),
            Phase::new("c", "C", "#333333", '3', 2),
        ]
    }

    /// 0.0, 0.1, ... 9.9 seconds.
    fn waveform() -> Waveform {
        Waveform::uniform(100, 0.1)
    }

    fn click(capture: &mut BoundaryCapture, time: f64, wave: &Waveform, phases: &[Phase]) -> ClickPlan {
        let plan = capture
            .plan_click(BoundaryClick::snapped(time, wave), Some(wave), phases)
            .unwrap();
        capture.commit(&plan);
        plan
    }

    fn span(plan: &ClickPlan) -> &SegmentSpan {
        match plan {
            ClickPlan::Segment { span, .. } => span,
            other => panic!("expected a segment, got {other:?}"),
        }
    }

    #[test]
    fn three_phase_cycle_completes_an_event() {
        let phases = abc();
        let wave = waveform();
        let mut capture = BoundaryCapture::new();
        capture.enable(&[], phases.len()).unwrap();
        assert_eq!(capture.status(), CaptureStatus::AwaitingStart);

        click(&mut capture, 1.0, &wave, &phases);
        assert_eq!(capture.status(), CaptureStatus::AwaitingEnd);

        let first = click(&mut capture, 2.0, &wave, &phases);
        let first = span(&first);
        assert_eq!(first.phase_id, "a");
        assert!((first.start.time - 1.0).abs() < 1e-9);
        assert!((first.end.time - 2.0).abs() < 1e-9);
        assert_eq!(first.event_index, 0);
        assert_eq!(capture.phase_index(), 1);

        let second = click(&mut capture, 3.0, &wave, &phases);
        assert_eq!(span(&second).phase_id, "b");
        assert_eq!(capture.phase_index(), 2);

        let third = click(&mut capture, 4.0, &wave, &phases);
        assert!(matches!(third, ClickPlan::Segment { completes_event: true, .. }));
        assert_eq!(span(&third).phase_id, "c");
        assert_eq!(capture.phase_index(), 0);
        assert_eq!(capture.event_index(), 1);
        assert_eq!(capture.pending(), None);
    }

    #[test]
    fn end_click_before_pending_is_rejected_without_change() {
        let phases = abc();
        let wave = waveform();
        let mut capture = BoundaryCapture::new();
        capture.enable(&[], phases.len()).unwrap();
        click(&mut capture, 5.0, &wave, &phases);
        let before = capture.clone();

        let result = capture.plan_click(BoundaryClick::snapped(4.5, &wave), Some(&wave), &phases);
        assert_eq!(
            result,
            Err(ValidationError::EndBeforeStart { start: 5.0, end: 4.5 })
        );
        assert_eq!(capture.pending(), before.pending());
        assert_eq!(capture.phase_index(), before.phase_index());

        let equal = capture.plan_click(BoundaryClick::snapped(5.0, &wave), Some(&wave), &phases);
        assert!(equal.is_err());
    }

    #[test]
    fn indices_are_clamped_to_the_sample_range() {
        let phases = abc();
        let wave = waveform();
        let mut capture = BoundaryCapture::new();
        capture.enable(&[], phases.len()).unwrap();
        let start = capture.plan_click(BoundaryClick::new(9.5, 95.0), Some(&wave), &phases).unwrap();
        capture.commit(&start);

        let plan = capture
            .plan_click(BoundaryClick::new(20.0, 400.0), Some(&wave), &phases)
            .unwrap();
        let span = span(&plan);
        assert_eq!(span.start.index, 95);
        assert_eq!(span.end.index, 99);
        assert!((span.end.time - 9.9).abs() < 1e-9);
    }

    #[test]
    fn start_on_last_sample_is_too_small() {
        let phases = abc();
        let wave = waveform();
        let mut capture = BoundaryCapture::new();
        capture.enable(&[], phases.len()).unwrap();
        let start = capture.plan_click(BoundaryClick::new(9.9, 99.0), Some(&wave), &phases).unwrap();
        capture.commit(&start);
        let result = capture.plan_click(BoundaryClick::new(12.0, 120.0), Some(&wave), &phases);
        assert_eq!(result, Err(ValidationError::RangeTooSmall));
    }

    #[test]
    fn same_sample_clicks_are_widened_to_one_sample() {
        let phases = abc();
        let wave = waveform();
        let mut capture = BoundaryCapture::new();
        capture.enable(&[], phases.len()).unwrap();
        let start = capture.plan_click(BoundaryClick::new(1.0, 10.0), Some(&wave), &phases).unwrap();
        capture.commit(&start);
        let plan = capture
            .plan_click(BoundaryClick::new(1.02, 10.0), Some(&wave), &phases)
            .unwrap();
        assert_eq!(span(&plan).end.index, 11);
    }

    #[test]
    fn non_finite_click_is_invalid() {
        let phases = abc();
        let mut capture = BoundaryCapture::new();
        capture.enable(&[], phases.len()).unwrap();
        let result = capture.plan_click(BoundaryClick::new(f64::NAN, 1.0), None, &phases);
        assert_eq!(result, Err(ValidationError::InvalidBoundary));
    }

    #[test]
    fn enable_resumes_first_incomplete_event() {
        let segments = vec![
            segment("0a", "a", 0, 1.0, 2.0),
            segment("0b", "b", 0, 2.0, 3.0),
            segment("0c", "c", 0, 3.0, 4.0),
            segment("1a", "a", 1, 5.0, 6.0),
        ];
        let mut capture = BoundaryCapture::for_segments(&segments);
        capture.enable(&segments, 3).unwrap();
        assert_eq!(capture.event_index(), 1);
        assert_eq!(capture.phase_index(), 1);
        assert_eq!(capture.pending().map(|b| b.time), Some(6.0));
        assert_eq!(capture.event_start().map(|b| b.time), Some(5.0));
        assert_eq!(capture.status(), CaptureStatus::AwaitingEnd);
    }

    #[test]
    fn enable_without_gaps_opens_next_event() {
        let segments = vec![segment("0a", "a", 3, 1.0, 2.0)];
        let mut capture = BoundaryCapture::new();
        capture.enable(&segments, 1).unwrap();
        assert_eq!(capture.event_index(), 4);
        assert_eq!(capture.pending(), None);
    }

    #[test]
    fn enable_requires_phases() {
        let mut capture = BoundaryCapture::new();
        assert_eq!(capture.enable(&[], 0), Err(ValidationError::NoPhases));
        assert!(!capture.is_annotating());
    }

    #[test]
    fn disable_is_blocked_by_pending_boundary() {
        let phases = abc();
        let wave = waveform();
        let mut capture = BoundaryCapture::new();
        capture.enable(&[], phases.len()).unwrap();
        click(&mut capture, 1.0, &wave, &phases);
        assert_eq!(capture.disable(), Err(ValidationError::PendingBoundary));
        assert!(capture.is_annotating());

        capture.reset_flow(0);
        capture.disable().unwrap();
        assert_eq!(capture.status(), CaptureStatus::Idle);
    }

    #[test]
    fn advance_phase_carries_last_segment_end() {
        let segments = vec![segment("0a", "a", 0, 1.0, 2.0)];
        let mut capture = BoundaryCapture::new();
        capture.enable(&segments, 3).unwrap();
        capture.advance_phase(&segments, 3).unwrap();
        assert_eq!(capture.phase_index(), 2);
        assert_eq!(capture.pending().map(|b| b.time), Some(2.0));

        capture.advance_phase(&segments, 3).unwrap();
        assert_eq!(capture.phase_index(), 0);
        assert_eq!(capture.event_index(), 1);
        assert_eq!(capture.pending(), None);
    }

    #[test]
    fn shortcut_selects_phase_without_touching_boundary() {
        let phases = abc();
        let wave = waveform();
        let mut capture = BoundaryCapture::new();
        capture.enable(&[], phases.len()).unwrap();
        click(&mut capture, 1.0, &wave, &phases);
        assert!(capture.select_by_shortcut('3', &phases));
        assert_eq!(capture.phase_index(), 2);
        assert_eq!(capture.pending().map(|b| b.time), Some(1.0));
        assert!(!capture.select_by_shortcut('9', &phases));
        assert_eq!(capture.phase_index(), 2);
    }

    #[test]
    fn k_full_cycles_produce_k_events() {
        let phases = abc();
        let wave = waveform();
        let mut capture = BoundaryCapture::new();
        capture.enable(&[], phases.len()).unwrap();

        let mut spans = Vec::new();
        let mut t = 0.5;
        for _ in 0..3 {
            click(&mut capture, t, &wave, &phases);
            for _ in 0..phases.len() {
                t += 0.5;
                spans.push(span(&click(&mut capture, t, &wave, &phases)).clone());
            }
            t += 0.5;
        }
        assert_eq!(spans.len(), 9);
        for event in 0..3u32 {
            let members: Vec<_> = spans.iter().filter(|s| s.event_index == event).collect();
            assert_eq!(members.len(), 3);
            let ids: Vec<_> = members.iter().map(|s| s.phase_id.as_str()).collect();
            assert_eq!(ids, ["a", "b", "c"]);
        }
    }
}
