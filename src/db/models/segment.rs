use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one trial inside one recorded file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialKey {
    pub file_id: String,
    pub trial_index: u32,
}

impl TrialKey {
    pub fn new(file_id: impl Into<String>, trial_index: u32) -> Self {
        Self {
            file_id: file_id.into(),
            trial_index,
        }
    }
}

impl std::fmt::Display for TrialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.file_id, self.trial_index)
    }
}

/// One phase-tagged interval of an event.
///
/// `end_time > start_time` and `end_index > start_index` hold for every
/// segment the capture machine produces; indices are clamped into the
/// sample range of the waveform the segment was drawn on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: String,
    pub file_id: String,
    pub trial_index: u32,
    pub phase_id: String,
    pub phase_name: String,
    pub start_time: f64,
    pub end_time: f64,
    pub start_index: usize,
    pub end_index: usize,
    pub event_index: u32,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Local bookkeeping only; the server never sends it.
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub version_id: Option<String>,
}

impl Segment {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn trial_key(&self) -> TrialKey {
        TrialKey::new(self.file_id.clone(), self.trial_index)
    }
}

/// Field-level edit applied through `AnnotationController::update_segment`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentPatch {
    pub phase_id: Option<String>,
    pub phase_name: Option<String>,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub start_index: Option<usize>,
    pub end_index: Option<usize>,
    pub color: Option<String>,
    pub label: Option<String>,
}

impl SegmentPatch {
    pub fn is_empty(&self) -> bool {
        self == &SegmentPatch::default()
    }

    /// Applies the patch to a copy and checks the interval invariants on
    /// the result, so a rejected patch leaves `segment` untouched.
    pub fn apply_to(&self, segment: &Segment) -> Result<Segment, String> {
        let mut next = segment.clone();
        if let Some(phase_id) = &self.phase_id {
            next.phase_id = phase_id.clone();
        }
        if let Some(phase_name) = &self.phase_name {
            next.phase_name = phase_name.clone();
        }
        if let Some(start_time) = self.start_time {
            next.start_time = start_time;
        }
        if let Some(end_time) = self.end_time {
            next.end_time = end_time;
        }
        if let Some(start_index) = self.start_index {
            next.start_index = start_index;
        }
        if let Some(end_index) = self.end_index {
            next.end_index = end_index;
        }
        if let Some(color) = &self.color {
            next.color = Some(color.clone());
        }
        if let Some(label) = &self.label {
            next.label = if label.is_empty() {
                None
            } else {
                Some(label.clone())
            };
        }

        if !next.start_time.is_finite() || !next.end_time.is_finite() {
            return Err("times must be finite".into());
        }
        if next.end_time <= next.start_time {
            return Err(format!(
                "end time {} must exceed start time {}",
                next.end_time, next.start_time
            ));
        }
        if next.end_index <= next.start_index {
            return Err(format!(
                "end index {} must exceed start index {}",
                next.end_index, next.start_index
            ));
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Segment {
        let now = Utc::now();
        Segment {
            id: "seg-1".into(),
            file_id: "file.h5".into(),
            trial_index: 0,
            phase_id: "baseline".into(),
            phase_name: "Baseline".into(),
            start_time: 1.0,
            end_time: 2.0,
            start_index: 10,
            end_index: 20,
            event_index: 0,
            color: Some("#38BDF8".into()),
            label: None,
            created_at: now,
            updated_at: now,
            synced: true,
            user_id: None,
            version_id: None,
        }
    }

    #[test]
    fn patch_rejects_inverted_interval() {
        let patch = SegmentPatch {
            end_time: Some(0.5),
            ..Default::default()
        };
        assert!(patch.apply_to(&sample()).is_err());
    }

    #[test]
    fn patch_clears_label_with_empty_string() {
        let mut segment = sample();
        segment.label = Some("noisy".into());
        let patch = SegmentPatch {
            label: Some(String::new()),
            ..Default::default()
        };
        let next = patch.apply_to(&segment).unwrap();
        assert_eq!(next.label, None);
    }

    #[test]
    fn deserializes_server_payload_without_local_fields() {
        let json = r#"{
            "id": "abc", "fileId": "f", "trialIndex": 2, "phaseId": "impact",
            "phaseName": "Impact", "startTime": 0.5, "endTime": 0.75,
            "startIndex": 5, "endIndex": 7, "eventIndex": 1, "color": null,
            "createdAt": "2024-05-01T10:00:00Z", "updatedAt": "2024-05-01T10:00:00Z"
        }"#;
        let segment: Segment = serde_json::from_str(json).unwrap();
        assert!(!segment.synced);
        assert_eq!(segment.trial_key(), TrialKey::new("f", 2));
        assert_eq!(segment.color, None);
    }
}
