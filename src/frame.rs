//! Frame decoding.
//!
//! A `DecodedImage` lives for one analysis pass only. Nothing here retains
//! pixels across frames.

use anyhow::{Context, Result};
use image::RgbImage;

use crate::demux::Frame;

/// Rasterized frame with a fixed RGB channel order.
pub type DecodedImage = RgbImage;

/// Decode one demuxed JPEG frame into RGB pixels.
pub fn decode_frame(frame: &Frame) -> Result<DecodedImage> {
    decode_jpeg(&frame.data).with_context(|| format!("decode frame at offset {}", frame.offset))
}

pub fn decode_jpeg(bytes: &[u8]) -> Result<DecodedImage> {
    let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .context("decode jpeg")?;
    Ok(image.into_rgb8())
}
