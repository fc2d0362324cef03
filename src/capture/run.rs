use anyhow::Context;
use crossbeam_channel::Receiver;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array2;

use super::{CaptureSession, CaptureState, OperatorCommand, RecordOutcome};
use crate::{detector::LandmarkDetector, source::FrameSource, store::SampleStore};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub frames: usize,
    pub frames_with_hands: usize,
    /// `(label, rows appended)` per write, in write order.
    pub saved: Vec<(String, usize)>,
}

fn recording_bar(label: &str, quota: usize) -> ProgressBar {
    let pb = ProgressBar::new(quota as u64);
    if let Ok(style) = ProgressStyle::with_template("{msg:>14} [{wide_bar:.cyan/blue}] {pos}/{len}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_message(label.to_string());
    pb
}

fn persist(
    store: &SampleStore,
    label: &str,
    rows: &Array2<f32>,
    summary: &mut CaptureSummary,
) -> anyhow::Result<()> {
    let total = store
        .append(label, rows)
        .with_context(|| format!("failed to save samples for {label}"))?;
    log::info!("{label}: {} new rows, {total} on disk", rows.nrows());
    summary.saved.push((label.to_string(), rows.nrows()));
    Ok(())
}

/// Pull frames until the operator quits or the source runs dry, then flush
/// every buffered label to `store`.
///
/// A label is written as soon as it reaches its quota. Frame read and
/// detection failures are logged and skipped. A failed write stops the
/// capture, but the other buffered labels are still flushed before the
/// error is returned.
pub fn run_capture<S, D>(
    source: &mut S,
    detector: &mut D,
    session: &mut CaptureSession,
    store: &SampleStore,
    commands: &Receiver<OperatorCommand>,
) -> anyhow::Result<CaptureSummary>
where
    S: FrameSource + ?Sized,
    D: LandmarkDetector + ?Sized,
{
    let mut summary = CaptureSummary::default();
    let mut failure: Option<anyhow::Error> = None;
    let mut progress: Option<ProgressBar> = match session.state() {
        CaptureState::Recording { label, .. } => {
            Some(recording_bar(&session.labels()[*label], session.quota()))
        }
        CaptureState::Idle => None,
    };

    'capture: loop {
        for command in commands.try_iter() {
            let selected = match command {
                OperatorCommand::Quit => {
                    log::info!("quit requested");
                    break 'capture;
                }
                OperatorCommand::Help => {
                    println!("{}", session.menu());
                    continue;
                }
                OperatorCommand::Select(index) => session.select(index),
                OperatorCommand::SelectLabel(name) => session.select_label(&name),
            };
            match selected {
                Ok(()) => {
                    if let CaptureState::Recording { label, .. } = session.state() {
                        let name = &session.labels()[*label];
                        log::info!("recording {name}");
                        if let Some(pb) = progress.take() {
                            pb.abandon();
                        }
                        progress = Some(recording_bar(name, session.quota()));
                    }
                }
                Err(err) => log::warn!("{err}"),
            }
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("frame source exhausted");
                break;
            }
            Err(err) => {
                log::warn!("frame read failed: {err:?}");
                continue;
            }
        };
        summary.frames += 1;

        if session.state() == &CaptureState::Idle {
            continue;
        }

        let hands = match detector.detect(&frame) {
            Ok(hands) => hands,
            Err(err) => {
                log::warn!("hand detection failed: {err:?}");
                continue;
            }
        };
        if !hands.is_empty() {
            summary.frames_with_hands += 1;
        }

        match session.record(&hands) {
            RecordOutcome::Skipped => {}
            RecordOutcome::Recorded { count, .. } => {
                if let Some(pb) = progress.as_ref() {
                    pb.set_position(count as u64);
                }
            }
            RecordOutcome::QuotaReached { label, count } => {
                if let Some(pb) = progress.take() {
                    pb.set_position(count as u64);
                    pb.finish();
                }
                log::info!("{}: quota of {count} reached", session.labels()[label]);
                if let Some((name, rows)) = session.take_buffer(label) {
                    if let Err(err) = persist(store, &name, &rows, &mut summary) {
                        failure = Some(err);
                        break;
                    }
                }
            }
        }
    }

    if let Some(pb) = progress.take() {
        pb.abandon();
    }
    for (name, rows) in session.drain() {
        if let Err(err) = persist(store, &name, &rows, &mut summary) {
            log::error!("{err:?}");
            failure.get_or_insert(err);
        }
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(summary),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::anyhow;
    use crossbeam_channel::unbounded;

    use super::*;
    use crate::{
        dataset::load_samples,
        types::{Frame, HandLandmarks, NUM_LANDMARKS},
    };

    /// Frames whose first pixel value doubles as the fake landmark value;
    /// `None` entries simulate a failed read.
    struct ScriptedSource(VecDeque<Option<u8>>);

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
            match self.0.pop_front() {
                None => Ok(None),
                Some(None) => Err(anyhow!("dropped frame")),
                Some(Some(v)) => Ok(Some(Frame {
                    rgb: vec![v; 3],
                    width: 1,
                    height: 1,
                })),
            }
        }
    }

    /// Reports a hand for every non-zero frame.
    struct PixelDetector;

    impl LandmarkDetector for PixelDetector {
        fn detect(&mut self, frame: &Frame) -> anyhow::Result<Vec<HandLandmarks>> {
            let v = frame.rgb[0];
            if v == 0 {
                return Ok(Vec::new());
            }
            Ok(vec![HandLandmarks::from_points(
                [[v as f32; 3]; NUM_LANDMARKS],
            )])
        }
    }

    fn labels() -> Vec<String> {
        vec!["mute".to_string(), "grab".to_string()]
    }

    #[test]
    fn persists_at_quota_and_flushes_on_exhaustion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SampleStore::new(dir.path());
        let mut session = CaptureSession::new(labels(), 2, 1).expect("session");
        session.select(1).expect("arm");

        let mut source = ScriptedSource(
            [Some(5), None, Some(0), Some(6), Some(7)]
                .into_iter()
                .collect(),
        );
        let (tx, rx) = unbounded();
        drop(tx);

        let summary =
            run_capture(&mut source, &mut PixelDetector, &mut session, &store, &rx).expect("run");
        assert_eq!(summary.frames, 4);
        assert_eq!(summary.frames_with_hands, 2);
        assert_eq!(summary.saved, vec![("grab".to_string(), 2)]);

        let grab = load_samples(&store.path_for("grab")).expect("grab");
        assert_eq!(grab.shape(), &[2, 63]);
        assert_eq!(grab[[1, 0]], 6.0);
        assert!(!store.path_for("mute").exists());
    }

    #[test]
    fn failed_quota_write_still_flushes_other_labels() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SampleStore::new(dir.path());
        // A directory where the temp file should go makes the write fail.
        std::fs::create_dir_all(dir.path().join("grab.npy.partial")).expect("blocker");

        let mut session = CaptureSession::new(labels(), 2, 1).expect("session");
        session.select(0).expect("arm");
        session.record(&[HandLandmarks::from_points([[1.0; 3]; NUM_LANDMARKS])]);
        session.select(1).expect("arm");

        let mut source = ScriptedSource([Some(5), Some(6), Some(7)].into_iter().collect());
        let (_tx, rx) = unbounded();
        let err = run_capture(&mut source, &mut PixelDetector, &mut session, &store, &rx)
            .unwrap_err();
        assert!(format!("{err}").contains("grab"));

        let mute = load_samples(&store.path_for("mute")).expect("mute flushed");
        assert_eq!(mute.shape(), &[1, 63]);
        assert!(!store.path_for("grab").exists());
        assert_eq!(session.buffered(0), 0);
    }

    #[test]
    fn operator_commands_arm_and_quit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SampleStore::new(dir.path());
        let mut session = CaptureSession::new(labels(), 100, 1).expect("session");

        let (tx, rx) = unbounded();
        tx.send(OperatorCommand::Select(9)).unwrap();
        tx.send(OperatorCommand::SelectLabel("mute".to_string()))
            .unwrap();

        let mut source = ScriptedSource([Some(3), Some(4)].into_iter().collect());
        let summary =
            run_capture(&mut source, &mut PixelDetector, &mut session, &store, &rx).expect("run");
        // Quota not reached; the partial buffer is flushed at the end.
        assert_eq!(summary.saved, vec![("mute".to_string(), 2)]);

        tx.send(OperatorCommand::Select(1)).unwrap();
        tx.send(OperatorCommand::Quit).unwrap();
        let mut source = ScriptedSource([Some(9)].into_iter().collect());
        let summary =
            run_capture(&mut source, &mut PixelDetector, &mut session, &store, &rx).expect("run");
        assert_eq!(summary.frames, 0);
        assert!(summary.saved.is_empty());
    }
}
