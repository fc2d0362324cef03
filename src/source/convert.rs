//! Raw camera buffers to packed RGB8.

use anyhow::{Result, anyhow};
use rayon::prelude::*;
use yuv::{
    YuvBiPlanarImage, YuvConversionMode, YuvPackedImage, YuvRange, YuvStandardMatrix,
    yuv_nv12_to_rgb, yuyv422_to_rgb,
};
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

/// Pixel layouts a capture device may hand us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    Nv12,
    Yuyv,
    Mjpeg,
    Rgb,
    Bgr,
    Gray,
}

pub fn to_rgb(layout: PixelLayout, data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    match layout {
        PixelLayout::Nv12 => nv12_to_rgb(data, width, height),
        PixelLayout::Yuyv => yuyv_to_rgb(data, width, height),
        PixelLayout::Mjpeg => mjpeg_to_rgb(data, width, height),
        PixelLayout::Rgb => packed_to_rgb(data, width, height, false),
        PixelLayout::Bgr => packed_to_rgb(data, width, height, true),
        PixelLayout::Gray => gray_to_rgb(data, width, height),
    }
}

fn pixel_count(width: u32, height: u32) -> usize {
    width as usize * height as usize
}

fn check_len(kind: &str, got: usize, expected: usize) -> Result<()> {
    if got < expected {
        return Err(anyhow!(
            "{kind} buffer too small: got {got}, expected {expected}"
        ));
    }
    Ok(())
}

fn nv12_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let y_len = pixel_count(width, height);
    let uv_len = y_len / 2;
    check_len("NV12", data.len(), y_len + uv_len)?;

    let image = YuvBiPlanarImage {
        y_plane: &data[..y_len],
        y_stride: width,
        uv_plane: &data[y_len..y_len + uv_len],
        uv_stride: width,
        width,
        height,
    };
    let mut rgb = vec![0u8; y_len * 3];
    yuv_nv12_to_rgb(
        &image,
        &mut rgb,
        width * 3,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
        YuvConversionMode::Balanced,
    )
    .map_err(|err| anyhow!("NV12 to RGB failed: {err:?}"))?;
    Ok(rgb)
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    check_len("YUYV", data.len(), pixel_count(width, height) * 2)?;

    let packed = YuvPackedImage {
        yuy: data,
        yuy_stride: width * 2,
        width,
        height,
    };
    let mut rgb = vec![0u8; pixel_count(width, height) * 3];
    yuyv422_to_rgb(
        &packed,
        &mut rgb,
        width * 3,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
    )
    .map_err(|err| anyhow!("YUYV422 to RGB failed: {err:?}"))?;
    Ok(rgb)
}

fn mjpeg_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(ZCursor::new(data), options);
    let rgb = decoder
        .decode()
        .map_err(|err| anyhow!("MJPEG decode failed: {err:?}"))?;
    check_len("MJPEG", rgb.len(), pixel_count(width, height) * 3)?;
    Ok(rgb)
}

fn packed_to_rgb(data: &[u8], width: u32, height: u32, swap_rb: bool) -> Result<Vec<u8>> {
    let len = pixel_count(width, height) * 3;
    check_len("RGB", data.len(), len)?;
    let mut rgb = data[..len].to_vec();
    if swap_rb {
        rgb.par_chunks_exact_mut(3).for_each(|px| px.swap(0, 2));
    }
    Ok(rgb)
}

fn gray_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let len = pixel_count(width, height);
    check_len("GRAY", data.len(), len)?;
    let mut rgb = vec![0u8; len * 3];
    rgb.par_chunks_exact_mut(3)
        .zip(data[..len].par_iter().copied())
        .for_each(|(dst, value)| dst.fill(value));
    Ok(rgb)
}
