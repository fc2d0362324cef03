use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use ndarray::Array4;
use rayon::prelude::*;

use crate::types::{Frame, NUM_LANDMARKS};

/// Square input edge of the handpose estimator.
pub const INPUT_SIZE: u32 = 224;
/// Square input edge of the palm detector.
pub const PALM_INPUT_SIZE: u32 = 192;

#[derive(Clone, Debug, PartialEq)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_w: u32,
    pub orig_h: u32,
}

/// A square, rotated window of the source frame resampled to
/// `output_size x output_size`.
#[derive(Clone, Debug, PartialEq)]
pub struct CropTransform {
    pub center: (f32, f32),
    pub side: f32,
    pub angle: f32,
    pub output_size: u32,
    pub orig_w: u32,
    pub orig_h: u32,
}

fn check_buffer(frame: &Frame) -> Result<()> {
    if frame.width == 0 || frame.height == 0 {
        return Err(anyhow!("empty frame {}x{}", frame.width, frame.height));
    }
    if frame.rgb.len() != frame.expected_len() {
        return Err(anyhow!(
            "frame buffer size mismatch: got {}, expected {}",
            frame.rgb.len(),
            frame.expected_len()
        ));
    }
    Ok(())
}

/// Resize `frame` into a black `target x target` square keeping its aspect
/// ratio, as an NHWC tensor scaled to `[0, 1]`.
pub fn letterbox(frame: &Frame, target: u32) -> Result<(Array4<f32>, LetterboxInfo)> {
    check_buffer(frame)?;

    let scale = target as f32 / frame.width.max(frame.height) as f32;
    let new_w = ((frame.width as f32 * scale).round() as u32).clamp(1, target);
    let new_h = ((frame.height as f32 * scale).round() as u32).clamp(1, target);

    let src = fir::images::Image::from_vec_u8(
        frame.width,
        frame.height,
        frame.rgb.clone(),
        fir::PixelType::U8x3,
    )?;
    let mut dst = fir::images::Image::new(new_w, new_h, fir::PixelType::U8x3);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    fir::Resizer::new()
        .resize(&src, &mut dst, Some(&options))
        .context("fast resize failed")?;
    let resized = dst.into_vec();

    let pad_x = (target - new_w) as usize / 2;
    let pad_y = (target - new_h) as usize / 2;
    let dst_stride = target as usize * 3;
    let src_stride = new_w as usize * 3;
    let mut canvas = vec![0u8; target as usize * dst_stride];
    for (row, src_row) in resized.chunks_exact(src_stride).enumerate() {
        let offset = (pad_y + row) * dst_stride + pad_x * 3;
        canvas[offset..offset + src_stride].copy_from_slice(src_row);
    }

    let pixels: Vec<f32> = canvas.par_iter().map(|&v| v as f32 / 255.0).collect();
    let input = Array4::from_shape_vec((1, target as usize, target as usize, 3), pixels)
        .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;

    Ok((
        input,
        LetterboxInfo {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
            orig_w: frame.width,
            orig_h: frame.height,
        },
    ))
}

/// Bilinear sample of a rotated square around `center`, `side` pixels wide,
/// as an NHWC tensor scaled to `[0, 1]`. Pixels outside the frame are black.
pub fn prepare_rotated_crop(
    frame: &Frame,
    center: (f32, f32),
    side: f32,
    angle: f32,
    output_size: u32,
) -> Result<(Array4<f32>, CropTransform)> {
    check_buffer(frame)?;
    let transform = CropTransform {
        center,
        side,
        angle,
        output_size,
        orig_w: frame.width,
        orig_h: frame.height,
    };

    let size = output_size as usize;
    let mut data = vec![0.0f32; size * size * 3];
    data.par_chunks_exact_mut(size * 3)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                let (sx, sy) = transform.to_source(x as f32 + 0.5, y as f32 + 0.5);
                px.copy_from_slice(&sample_rgb(frame, sx, sy));
            }
        });

    let array = Array4::from_shape_vec((1, size, size, 3), data)
        .map_err(|err| anyhow!("failed to build rotated crop tensor: {err}"))?;
    Ok((array, transform))
}

impl CropTransform {
    /// Crop pixel coordinates to unclamped source pixel coordinates.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        let half = self.output_size as f32 / 2.0;
        let scale = self.pixel_scale();
        let dx = (x - half) * scale;
        let dy = (y - half) * scale;
        let (sin, cos) = self.angle.sin_cos();
        (
            self.center.0 + dx * cos - dy * sin,
            self.center.1 + dx * sin + dy * cos,
        )
    }

    /// Source pixels per crop pixel.
    pub fn pixel_scale(&self) -> f32 {
        self.side / self.output_size as f32
    }

    /// Crop pixel coordinates to source pixel coordinates inside the frame.
    pub fn project(&self, x: f32, y: f32) -> (f32, f32) {
        let (ox, oy) = self.to_source(x, y);
        (
            ox.clamp(0.0, self.orig_w.saturating_sub(1) as f32),
            oy.clamp(0.0, self.orig_h.saturating_sub(1) as f32),
        )
    }
}

fn sample_rgb(frame: &Frame, x: f32, y: f32) -> [f32; 3] {
    if !x.is_finite() || !y.is_finite() {
        return [0.0; 3];
    }
    // Pixel centers sit at +0.5.
    let x = x - 0.5;
    let y = y - 0.5;
    let x0 = x.floor();
    let y0 = y.floor();
    let (w, h) = (frame.width as i64, frame.height as i64);

    let fetch = |cx: f32, cy: f32| -> [f32; 3] {
        let (ix, iy) = (cx as i64, cy as i64);
        if ix < 0 || iy < 0 || ix >= w || iy >= h {
            return [0.0; 3];
        }
        let idx = (iy as usize * frame.width as usize + ix as usize) * 3;
        [
            frame.rgb[idx] as f32 / 255.0,
            frame.rgb[idx + 1] as f32 / 255.0,
            frame.rgb[idx + 2] as f32 / 255.0,
        ]
    };

    let fx = x - x0;
    let fy = y - y0;
    let c00 = fetch(x0, y0);
    let c10 = fetch(x0 + 1.0, y0);
    let c01 = fetch(x0, y0 + 1.0);
    let c11 = fetch(x0 + 1.0, y0 + 1.0);

    let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
    std::array::from_fn(|c| lerp(lerp(c00[c], c10[c], fx), lerp(c01[c], c11[c], fx), fy))
}

pub fn decode_landmarks(flat: &[f32]) -> Result<[[f32; 3]; NUM_LANDMARKS]> {
    if flat.len() < NUM_LANDMARKS * 3 {
        return Err(anyhow!(
            "unexpected landmarks length: got {}, need {}",
            flat.len(),
            NUM_LANDMARKS * 3
        ));
    }
    let mut points = [[0.0; 3]; NUM_LANDMARKS];
    for (point, chunk) in points.iter_mut().zip(flat.chunks_exact(3)) {
        point.copy_from_slice(chunk);
    }
    Ok(points)
}

/// Map crop-space points back to the source frame, as fractions of its
/// width and height. `z` is scaled like `x`. With `mirror` the x axis is
/// flipped so the result matches a selfie view.
pub fn to_image_space(
    points: &[[f32; 3]; NUM_LANDMARKS],
    transform: &CropTransform,
    mirror: bool,
) -> [[f32; 3]; NUM_LANDMARKS] {
    let w = transform.orig_w.max(1) as f32;
    let h = transform.orig_h.max(1) as f32;
    let z_scale = transform.pixel_scale() / w;
    points.map(|[x, y, z]| {
        let (px, py) = transform.project(x, y);
        let nx = px / w;
        [if mirror { 1.0 - nx } else { nx }, py / h, z * z_scale]
    })
}
