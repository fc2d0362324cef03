//! Label-armed landmark recording.
//!
//! [`CaptureSession`] is the pure state machine; [`run_capture`] drives it
//! from a frame source, a detector and operator commands, and persists the
//! buffered rows through a [`SampleStore`](crate::store::SampleStore).

mod commands;
mod run;

use ndarray::Array2;

use crate::{
    store,
    types::{FEATURE_LEN, HandLandmarks},
};

pub use commands::{OperatorCommand, parse_command, spawn_operator_input};
pub use run::{CaptureSummary, run_capture};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CaptureError {
    #[error("at least one label is required")]
    NoLabels,
    #[error("quota must be at least 1")]
    ZeroQuota,
    #[error("label {0:?} must be non-empty and free of '.', '/' and '\\'")]
    BadLabel(String),
    #[error("label {0:?} is configured twice")]
    DuplicateLabel(String),
    #[error("label index {index} out of range, {count} labels configured")]
    UnknownIndex { index: usize, count: usize },
    #[error("unknown label {0:?}")]
    UnknownLabel(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Recording { label: usize, count: usize },
}

/// Result of feeding one frame's detections to the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Not recording, or no hand in the frame.
    Skipped,
    Recorded { label: usize, count: usize },
    /// The armed label reached its quota and the session is idle again.
    QuotaReached { label: usize, count: usize },
}

#[derive(Debug)]
pub struct CaptureSession {
    labels: Vec<String>,
    quota: usize,
    max_hands: usize,
    state: CaptureState,
    buffers: Vec<Vec<[f32; FEATURE_LEN]>>,
}

impl CaptureSession {
    pub fn new(labels: Vec<String>, quota: usize, max_hands: usize) -> Result<Self, CaptureError> {
        if labels.is_empty() {
            return Err(CaptureError::NoLabels);
        }
        if quota == 0 {
            return Err(CaptureError::ZeroQuota);
        }
        for (i, label) in labels.iter().enumerate() {
            if !store::is_valid_label(label) {
                return Err(CaptureError::BadLabel(label.clone()));
            }
            if labels[..i].contains(label) {
                return Err(CaptureError::DuplicateLabel(label.clone()));
            }
        }
        Ok(Self {
            buffers: vec![Vec::new(); labels.len()],
            labels,
            quota,
            max_hands: max_hands.max(1),
            state: CaptureState::Idle,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    pub fn buffered(&self, label: usize) -> usize {
        self.buffers.get(label).map_or(0, Vec::len)
    }

    /// Arm `index` with a fresh count. Rows already buffered for any label
    /// are kept.
    pub fn select(&mut self, index: usize) -> Result<(), CaptureError> {
        if index >= self.labels.len() {
            return Err(CaptureError::UnknownIndex {
                index,
                count: self.labels.len(),
            });
        }
        self.state = CaptureState::Recording {
            label: index,
            count: 0,
        };
        Ok(())
    }

    pub fn select_label(&mut self, name: &str) -> Result<(), CaptureError> {
        let index = self
            .labels
            .iter()
            .position(|l| l == name)
            .ok_or_else(|| CaptureError::UnknownLabel(name.to_string()))?;
        self.select(index)
    }

    /// Buffer up to `max_hands` raw feature vectors from one frame.
    pub fn record(&mut self, hands: &[HandLandmarks]) -> RecordOutcome {
        let CaptureState::Recording { label, mut count } = self.state else {
            return RecordOutcome::Skipped;
        };
        if hands.is_empty() {
            return RecordOutcome::Skipped;
        }

        for hand in hands.iter().take(self.max_hands) {
            self.buffers[label].push(hand.to_feature_vector());
            count += 1;
            if count >= self.quota {
                self.state = CaptureState::Idle;
                return RecordOutcome::QuotaReached { label, count };
            }
        }
        self.state = CaptureState::Recording { label, count };
        RecordOutcome::Recorded { label, count }
    }

    /// Remove and return the rows buffered for `label`, if any.
    pub fn take_buffer(&mut self, label: usize) -> Option<(String, Array2<f32>)> {
        let rows = std::mem::take(self.buffers.get_mut(label)?);
        if rows.is_empty() {
            return None;
        }
        let n = rows.len();
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        let matrix = Array2::from_shape_vec((n, FEATURE_LEN), flat).ok()?;
        Some((self.labels[label].clone(), matrix))
    }

    /// Every non-empty buffer, in label order. Leaves the session idle.
    pub fn drain(&mut self) -> Vec<(String, Array2<f32>)> {
        self.state = CaptureState::Idle;
        (0..self.labels.len())
            .filter_map(|label| self.take_buffer(label))
            .collect()
    }

    /// Numbered label list for the operator.
    pub fn menu(&self) -> String {
        let mut out = String::from("labels:\n");
        for (i, label) in self.labels.iter().enumerate() {
            out.push_str(&format!("  {i}: {label} ({} buffered)\n", self.buffered(i)));
        }
        out.push_str("  q: quit and save\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NUM_LANDMARKS;

    fn hand(value: f32) -> HandLandmarks {
        HandLandmarks::from_points([[value; 3]; NUM_LANDMARKS])
    }

    fn session(quota: usize, max_hands: usize) -> CaptureSession {
        CaptureSession::new(
            vec!["mute".to_string(), "grab".to_string()],
            quota,
            max_hands,
        )
        .expect("session")
    }

    #[test]
    fn idle_session_ignores_frames() {
        let mut s = session(3, 1);
        assert_eq!(s.record(&[hand(1.0)]), RecordOutcome::Skipped);
        assert_eq!(s.buffered(0), 0);
    }

    #[test]
    fn records_until_quota_then_idles() {
        let mut s = session(3, 1);
        s.select(1).expect("select");
        assert_eq!(s.record(&[]), RecordOutcome::Skipped);
        assert_eq!(
            s.record(&[hand(1.0)]),
            RecordOutcome::Recorded { label: 1, count: 1 }
        );
        s.record(&[hand(2.0)]);
        assert_eq!(
            s.record(&[hand(3.0)]),
            RecordOutcome::QuotaReached { label: 1, count: 3 }
        );
        assert_eq!(s.state(), &CaptureState::Idle);
        assert_eq!(s.record(&[hand(4.0)]), RecordOutcome::Skipped);

        let (label, rows) = s.take_buffer(1).expect("rows");
        assert_eq!(label, "grab");
        assert_eq!(rows.dim(), (3, FEATURE_LEN));
        assert_eq!(rows[[2, 0]], 3.0);
        assert!(s.take_buffer(1).is_none());
    }

    #[test]
    fn only_max_hands_are_taken_per_frame() {
        let mut single = session(10, 1);
        single.select(0).expect("select");
        single.record(&[hand(1.0), hand(2.0)]);
        assert_eq!(single.buffered(0), 1);

        let mut multi = session(3, 2);
        multi.select(0).expect("select");
        multi.record(&[hand(1.0), hand(2.0)]);
        assert_eq!(multi.buffered(0), 2);
        // Quota is hit mid-frame; the extra hand is not buffered.
        assert_eq!(
            multi.record(&[hand(3.0), hand(4.0)]),
            RecordOutcome::QuotaReached { label: 0, count: 3 }
        );
        assert_eq!(multi.buffered(0), 3);
    }

    #[test]
    fn switching_labels_keeps_buffers() {
        let mut s = session(5, 1);
        s.select_label("mute").expect("select");
        s.record(&[hand(1.0)]);
        s.record(&[hand(1.0)]);
        s.select_label("grab").expect("select");
        assert_eq!(s.state(), &CaptureState::Recording { label: 1, count: 0 });
        s.record(&[hand(2.0)]);

        let drained = s.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, "mute");
        assert_eq!(drained[0].1.nrows(), 2);
        assert_eq!(drained[1].1.nrows(), 1);
        assert_eq!(s.state(), &CaptureState::Idle);
        assert!(s.drain().is_empty());
    }

    #[test]
    fn bad_selections_are_reported() {
        let mut s = session(5, 1);
        assert_eq!(
            s.select(7),
            Err(CaptureError::UnknownIndex { index: 7, count: 2 })
        );
        assert_eq!(
            s.select_label("wave"),
            Err(CaptureError::UnknownLabel("wave".to_string()))
        );
        assert_eq!(s.state(), &CaptureState::Idle);
        assert!(CaptureSession::new(Vec::new(), 1, 1).is_err());
        assert!(CaptureSession::new(vec!["a".to_string()], 0, 1).is_err());
        assert!(s.menu().contains("1: grab"));
    }

    #[test]
    fn labels_must_survive_the_file_name() {
        let labels = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            CaptureSession::new(labels(&["thumbs.up", "thumbs.down"]), 5, 1).unwrap_err(),
            CaptureError::BadLabel("thumbs.up".to_string())
        );
        assert_eq!(
            CaptureSession::new(labels(&["ok", "left/right"]), 5, 1).unwrap_err(),
            CaptureError::BadLabel("left/right".to_string())
        );
        assert_eq!(
            CaptureSession::new(labels(&["grab", "mute", "grab"]), 5, 1).unwrap_err(),
            CaptureError::DuplicateLabel("grab".to_string())
        );
        assert!(CaptureSession::new(labels(&["thumbs_up", "thumbs_down"]), 5, 1).is_ok());
    }
}
