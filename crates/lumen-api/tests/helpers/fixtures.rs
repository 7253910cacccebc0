//! Deterministic upload payloads.

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// A 3x3 solid-red PNG.
pub fn tiny_png() -> Vec<u8> {
    solid_png(3, 3)
}

pub fn solid_png(width: u32, height: u32) -> Vec<u8> {
    let mut buffer = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([255, 0, 0])))
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .expect("Failed to encode PNG");
    buffer
}

/// Pseudo-random filler behind an MP4 `ftyp` box, so content sniffing sees a video.
pub fn mp4_like(len: usize) -> Vec<u8> {
    let mut data = vec![0, 0, 0, 0x18];
    data.extend_from_slice(b"ftypisom");
    let mut state: u32 = 0x9e37_79b9;
    while data.len() < len {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        data.push((state >> 24) as u8);
    }
    data.truncate(len);
    data
}
