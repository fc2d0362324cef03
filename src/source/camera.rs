use anyhow::{Context, Result, anyhow};
use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    query,
    utils::{ApiBackend, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
};

use super::{
    FrameSource,
    convert::{self, PixelLayout},
};
use crate::types::Frame;

// Built-in macOS cameras often reject YUYV even though it is reported.
const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
    FrameFormat::RAWRGB,
    FrameFormat::RAWBGR,
    FrameFormat::GRAY,
    FrameFormat::YUYV,
    FrameFormat::NV12,
    FrameFormat::MJPEG,
];

fn requested_formats() -> [RequestedFormat<'static>; 4] {
    [
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestFrameRate,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestResolution,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
    ]
}

fn layout_of(format: FrameFormat) -> PixelLayout {
    match format {
        FrameFormat::NV12 => PixelLayout::Nv12,
        FrameFormat::YUYV => PixelLayout::Yuyv,
        FrameFormat::MJPEG => PixelLayout::Mjpeg,
        FrameFormat::RAWRGB => PixelLayout::Rgb,
        FrameFormat::RAWBGR => PixelLayout::Bgr,
        FrameFormat::GRAY => PixelLayout::Gray,
    }
}

/// Human readable names of the cameras the native backend can see.
pub fn list_cameras() -> Result<Vec<(u32, String)>> {
    let cameras = query(ApiBackend::Auto).context("failed to enumerate cameras")?;
    Ok(cameras
        .into_iter()
        .enumerate()
        .map(|(i, info)| (i as u32, info.human_name()))
        .collect())
}

/// Webcam read synchronously, one frame per call.
pub struct CameraSource {
    camera: Camera,
}

impl CameraSource {
    /// Open camera `index`, trying progressively looser format requests.
    pub fn open(index: u32) -> Result<Self> {
        let index = CameraIndex::Index(index);
        let mut last_err = None;

        for requested in requested_formats() {
            match Camera::new(index.clone(), requested) {
                Ok(mut camera) => match camera.open_stream() {
                    Ok(()) => {
                        log::info!(
                            "camera {index} opened at {} ({:?})",
                            camera.resolution(),
                            camera.frame_format()
                        );
                        return Ok(Self { camera });
                    }
                    Err(err) => last_err = Some(anyhow::Error::from(err)),
                },
                Err(err) => last_err = Some(anyhow::Error::from(err)),
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow!("no supported format"))
            .context(format!("failed to open camera {index}")))
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let buffer = self.camera.frame().context("camera frame read failed")?;
        let resolution = buffer.resolution();
        let (width, height) = (resolution.width_x, resolution.height_y);
        let rgb = convert::to_rgb(
            layout_of(buffer.source_frame_format()),
            buffer.buffer(),
            width,
            height,
        )?;
        Ok(Some(Frame {
            rgb,
            width,
            height,
        }))
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        if let Err(err) = self.camera.stop_stream() {
            log::warn!("failed to stop camera stream: {err:?}");
        }
    }
}
