//! Where frames come from: a live camera or a directory of still images.

#[cfg(feature = "camera-nokhwa")]
mod camera;
pub mod convert;

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

use crate::types::Frame;

#[cfg(feature = "camera-nokhwa")]
pub use camera::{CameraSource, list_cameras};

/// A pull-based frame producer.
///
/// `Err` is a transient read failure the caller may retry; `Ok(None)` means
/// the source is exhausted.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Still images from a directory, in file-name order.
pub struct ImageSequenceSource {
    paths: std::vec::IntoIter<PathBuf>,
}

impl ImageSequenceSource {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths = Vec::new();
        for entry in
            fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?
        {
            let path = entry
                .with_context(|| format!("failed to list {}", dir.display()))?
                .path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
            if is_image && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        log::info!("{} images queued from {}", paths.len(), dir.display());
        Ok(Self::from_paths(paths))
    }

    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        Self {
            paths: paths.into_iter(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.paths.len()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.paths.next() else {
            return Ok(None);
        };
        let img = image::open(&path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .to_rgb8();
        let (width, height) = img.dimensions();
        Ok(Some(Frame {
            rgb: img.into_raw(),
            width,
            height,
        }))
    }
}
