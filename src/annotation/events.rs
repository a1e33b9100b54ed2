use std::collections::BTreeMap;

use serde::Serialize;

use crate::db::models::Segment;

/// Time span covered by all segments sharing one event index.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationEvent {
    pub event_index: u32,
    pub start_time: f64,
    pub end_time: f64,
    pub segment_count: usize,
}

/// Events are never stored; this is recomputed from the segment set on
/// every read.
pub fn build_events(segments: &[Segment]) -> Vec<AnnotationEvent> {
    let mut events: BTreeMap<u32, AnnotationEvent> = BTreeMap::new();
    for segment in segments {
        let low = segment.start_time.min(segment.end_time);
        let high = segment.start_time.max(segment.end_time);
        events
            .entry(segment.event_index)
            .and_modify(|event| {
                event.start_time = event.start_time.min(low);
                event.end_time = event.end_time.max(high);
                event.segment_count += 1;
            })
            .or_insert(AnnotationEvent {
                event_index: segment.event_index,
                start_time: low,
                end_time: high,
                segment_count: 1,
            });
    }
    events.into_values().collect()
}

/// Segments of one event, ordered by start time.
pub fn event_segments(segments: &[Segment], event_index: u32) -> Vec<&Segment> {
    let mut members: Vec<&Segment> = segments
        .iter()
        .filter(|segment| segment.event_index == event_index)
        .collect();
    members.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
    members
}

pub fn next_event_index(segments: &[Segment]) -> u32 {
    segments
        .iter()
        .map(|segment| segment.event_index + 1)
        .max()
        .unwrap_or(0)
}

pub fn sort_segments(segments: &mut [Segment]) {
    segments.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::Utc;

    use crate::db::models::Segment;

    pub fn segment(id: &str, phase_id: &str, event_index: u32, start: f64, end: f64) -> Segment {
        let now = Utc::now();
        Segment {
            id: id.into(),
            file_id: "trial.h5".into(),
            trial_index: 0,
            phase_id: phase_id.into(),
            phase_name: phase_id.to_uppercase(),
            start_time: start,
            end_time: end,
            start_index: (start * 10.0) as usize,
            end_index: (end * 10.0) as usize,
            event_index,
            color: None,
            label: None,
            created_at: now,
            updated_at: now,
            synced: true,
            user_id: None,
            version_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::segment;
    use super::*;

    #[test]
    fn events_span_their_segments() {
        let segments = vec![
            segment("b", "b", 0, 2.0, 3.0),
            segment("a", "a", 0, 1.0, 2.0),
            segment("c", "a", 1, 5.0, 6.0),
        ];
        let events = build_events(&segments);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].start_time, 1.0);
        assert_eq!(events[0].end_time, 3.0);
        assert_eq!(events[0].segment_count, 2);
        assert_eq!(events[1].event_index, 1);
    }

    #[test]
    fn next_event_index_skips_past_highest() {
        assert_eq!(next_event_index(&[]), 0);
        let segments = vec![segment("1", "a", 4, 1.0, 2.0), segment("2", "a", 1, 3.0, 4.0)];
        assert_eq!(next_event_index(&segments), 5);
    }
}
