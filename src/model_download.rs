use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    HandposeEstimator,
    PalmDetector,
}

pub const HANDPOSE_MODEL_FILENAME: &str = "handpose_estimation_mediapipe_2023feb.onnx";
pub const HANDPOSE_MODEL_URL: &str = "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/handpose_estimation_mediapipe_2023feb.onnx";
pub const PALM_MODEL_FILENAME: &str = "palm_detection_mediapipe_2023feb.onnx";
pub const PALM_MODEL_URL: &str = "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/palm_detection_mediapipe_2023feb.onnx";

impl ModelKind {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::HandposeEstimator => HANDPOSE_MODEL_FILENAME,
            Self::PalmDetector => PALM_MODEL_FILENAME,
        }
    }

    pub fn default_url(self) -> &'static str {
        match self {
            Self::HandposeEstimator => HANDPOSE_MODEL_URL,
            Self::PalmDetector => PALM_MODEL_URL,
        }
    }

    pub fn default_path(self) -> PathBuf {
        PathBuf::from("models").join(self.file_name())
    }

    fn label(self) -> &'static str {
        match self {
            Self::HandposeEstimator => "handpose estimator",
            Self::PalmDetector => "palm detector",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadEvent {
    AlreadyPresent,
    Started { total: Option<u64> },
    Progress { downloaded: u64, total: Option<u64> },
    Finished,
}

/// Make sure the `model` file exists at `model_path`, fetching it from
/// `url` when missing. Progress is drawn on the terminal and also reported
/// through `on_event`.
pub fn ensure_model<F>(
    model: ModelKind,
    model_path: &Path,
    url: &str,
    mut on_event: F,
) -> anyhow::Result<()>
where
    F: FnMut(DownloadEvent),
{
    let label = model.label();
    if model_path.exists() {
        log::debug!("{label} model present at {}", model_path.display());
        on_event(DownloadEvent::AlreadyPresent);
        return Ok(());
    }

    if let Some(parent) = model_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create model directory {}", parent.display()))?;
    }

    let mut progress: Option<ProgressBar> = None;
    download_to_path(label, url, model_path, &mut |event| {
        match &event {
            DownloadEvent::Started { total } => progress = Some(create_progress_bar(*total)),
            DownloadEvent::Progress { downloaded, .. } => {
                if let Some(pb) = progress.as_ref() {
                    pb.set_position(*downloaded);
                }
            }
            DownloadEvent::Finished => {
                if let Some(pb) = progress.take() {
                    pb.finish_with_message(format!("{label} model ready"));
                }
            }
            DownloadEvent::AlreadyPresent => {}
        }
        on_event(event);
    })
    .with_context(|| format!("failed to download {label} model to {}", model_path.display()))
}

fn download_to_path<F>(label: &str, url: &str, dest: &Path, on_event: &mut F) -> anyhow::Result<()>
where
    F: FnMut(DownloadEvent),
{
    log::info!("downloading {label} model from {url} to {}", dest.display());

    let mut response = Client::new()
        .get(url)
        .send()
        .context("failed to start model download")?
        .error_for_status()
        .context("model download returned error status")?;

    let total = response.content_length();
    on_event(DownloadEvent::Started { total });

    let tmp_path = dest.with_extension("download");
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; 16 * 1024];
    loop {
        let read = response
            .read(&mut buffer)
            .context("failed while reading model bytes")?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .context("failed while writing model to disk")?;
        downloaded += read as u64;
        on_event(DownloadEvent::Progress { downloaded, total });
    }

    file.sync_all()
        .context("failed to flush downloaded model to disk")?;
    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            tmp_path.display(),
            dest.display()
        )
    })?;

    on_event(DownloadEvent::Finished);
    Ok(())
}

fn create_progress_bar(total: Option<u64>) -> ProgressBar {
    match total {
        Some(total) if total > 0 => {
            let pb = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            ) {
                pb.set_style(style.progress_chars("=>-"));
            }
            pb
        }
        _ => {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.green} downloading model") {
                pb.set_style(style);
            }
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_model_is_not_downloaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(PALM_MODEL_FILENAME);
        fs::write(&path, b"onnx").expect("write");

        let mut events = Vec::new();
        ensure_model(
            ModelKind::PalmDetector,
            &path,
            "http://127.0.0.1:9/unused",
            |e| events.push(e),
        )
        .expect("ensure");
        assert_eq!(events, vec![DownloadEvent::AlreadyPresent]);
    }

    #[test]
    fn default_paths_live_under_models() {
        for kind in [ModelKind::HandposeEstimator, ModelKind::PalmDetector] {
            let path = kind.default_path();
            assert!(path.starts_with("models"));
            assert!(path.to_string_lossy().ends_with(".onnx"));
            assert!(kind.default_url().ends_with(kind.file_name()));
        }
    }
}
