//! Image deriver: decode once, then thumbnail and optimised variant.

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};
use lumen_core::models::{MediaAttributes, MediaKind};
use lumen_core::AppError;
use std::io::Cursor;
use tokio::io::AsyncReadExt;

use crate::deriver::{ArtifactData, DeriveInput, Derivation, Deriver, OptimizedArtifact};
use crate::sniff::sniff_image;

pub const JPEG_QUALITY: u8 = 85;

pub struct ImageDeriver {
    thumbnail_edge: u32,
}

impl ImageDeriver {
    pub fn new(thumbnail_edge: u32) -> Self {
        Self {
            thumbnail_edge: thumbnail_edge.max(1),
        }
    }

    /// Synchronous core; callers run it on the blocking pool.
    pub fn derive_bytes(&self, data: &[u8]) -> Result<Derivation, AppError> {
        if sniff_image(data).is_none() {
            return Err(AppError::UnsupportedKind(
                "content is not a recognised image".to_string(),
            ));
        }

        let reader = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| AppError::DecodeFailed(e.to_string()))?;
        let format = reader.format().ok_or_else(|| {
            AppError::UnsupportedKind("image format could not be determined".to_string())
        })?;
        let img = reader
            .decode()
            .map_err(|e| AppError::DecodeFailed(e.to_string()))?;

        let (width, height) = img.dimensions();
        let mut attributes = MediaAttributes::from_dimensions(width, height);
        attributes.format = Some(format_name(format));

        let mut derivation = Derivation {
            attributes,
            ..Default::default()
        };

        match encode_thumbnail(&img, self.thumbnail_edge) {
            Ok(bytes) => derivation.thumbnail = Some(bytes),
            Err(e) => derivation.issues.push(format!("thumbnail: {}", e)),
        }
        match encode_optimized(&img, format) {
            Ok(artifact) => derivation.optimized = Some(artifact),
            Err(e) => derivation.issues.push(format!("optimized: {}", e)),
        }

        if derivation.thumbnail.is_none() && derivation.optimized.is_none() {
            return Err(AppError::DecodeFailed(derivation.issues.join("; ")));
        }
        Ok(derivation)
    }
}

fn format_name(format: ImageFormat) -> String {
    format!("{:?}", format).to_lowercase()
}

/// Fit the longest edge to `edge` without upscaling.
fn fit(img: &DynamicImage, edge: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    if width <= edge && height <= edge {
        img.clone()
    } else {
        img.resize(edge, edge, FilterType::Lanczos3)
    }
}

fn encode_jpeg(img: &DynamicImage) -> image::ImageResult<Bytes> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buffer = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY))?;
    Ok(Bytes::from(buffer))
}

fn encode_png(img: &DynamicImage) -> image::ImageResult<Bytes> {
    let mut buffer = Vec::new();
    img.write_with_encoder(PngEncoder::new_with_quality(
        &mut buffer,
        CompressionType::Best,
        PngFilter::Adaptive,
    ))?;
    Ok(Bytes::from(buffer))
}

fn encode_thumbnail(img: &DynamicImage, edge: u32) -> image::ImageResult<Bytes> {
    encode_jpeg(&fit(img, edge))
}

fn encode_optimized(img: &DynamicImage, format: ImageFormat) -> image::ImageResult<OptimizedArtifact> {
    let (extension, content_type, data) = match format {
        ImageFormat::Png => ("png", "image/png", encode_png(img)?),
        _ => ("jpg", "image/jpeg", encode_jpeg(img)?),
    };
    Ok(OptimizedArtifact {
        extension: extension.to_string(),
        content_type: content_type.to_string(),
        data: ArtifactData::Memory(data),
    })
}

#[async_trait]
impl Deriver for ImageDeriver {
    fn kind(&self) -> MediaKind {
        MediaKind::Image
    }

    #[tracing::instrument(skip(self, input), fields(media.id = %input.media_id, size = input.size_bytes))]
    async fn derive(&self, mut input: DeriveInput) -> Result<Derivation, AppError> {
        let capacity = usize::try_from(input.size_bytes).unwrap_or_default();
        let mut data = Vec::with_capacity(capacity);
        input.reader.read_to_end(&mut data).await?;

        let edge = self.thumbnail_edge;
        // Decode is CPU-bound; keep it off the async workers.
        let derivation = tokio::task::spawn_blocking(move || ImageDeriver::new(edge).derive_bytes(&data))
            .await
            .map_err(|e| AppError::Internal(format!("image derivation task failed: {}", e)))??;

        if !derivation.issues.is_empty() {
            tracing::warn!(issues = ?derivation.issues, "Image derivation incomplete");
        }
        Ok(derivation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([255, 0, 0, 255]));
        let mut buffer = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        buffer
    }

    fn gif_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([0, 0, 255]));
        let mut buffer = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Gif)
            .unwrap();
        buffer
    }

    fn input(data: Vec<u8>, filename: &str) -> DeriveInput {
        DeriveInput {
            media_id: "m1".into(),
            size_bytes: data.len() as u64,
            reader: Box::pin(Cursor::new(data)),
            filename: filename.into(),
            mime_type: "image/png".into(),
        }
    }

    #[tokio::test]
    async fn test_small_png_keeps_format_and_dimensions() {
        let derivation = ImageDeriver::new(300)
            .derive(input(png_bytes(3, 3), "tiny.png"))
            .await
            .unwrap();

        assert_eq!(derivation.attributes.width, Some(3));
        assert_eq!(derivation.attributes.height, Some(3));
        assert_eq!(derivation.attributes.format.as_deref(), Some("png"));
        assert_eq!(
            derivation.attributes.orientation,
            Some(lumen_core::models::Orientation::Square)
        );

        let thumb = derivation.thumbnail.unwrap();
        assert!(thumb.starts_with(&[0xFF, 0xD8, 0xFF]));
        let decoded = image::load_from_memory(&thumb).unwrap();
        assert_eq!(decoded.dimensions(), (3, 3));

        let optimized = derivation.optimized.unwrap();
        assert_eq!(optimized.extension, "png");
        assert_eq!(optimized.content_type, "image/png");
    }

    #[tokio::test]
    async fn test_thumbnail_fits_longest_edge() {
        let derivation = ImageDeriver::new(100)
            .derive(input(png_bytes(400, 200), "wide.png"))
            .await
            .unwrap();
        let thumb = image::load_from_memory(&derivation.thumbnail.unwrap()).unwrap();
        assert_eq!(thumb.dimensions(), (100, 50));
        assert_eq!(
            derivation.attributes.orientation,
            Some(lumen_core::models::Orientation::Landscape)
        );
    }

    #[tokio::test]
    async fn test_other_formats_are_optimized_to_jpeg() {
        let derivation = ImageDeriver::new(300)
            .derive(input(gif_bytes(4, 8), "anim.gif"))
            .await
            .unwrap();
        assert_eq!(derivation.attributes.format.as_deref(), Some("gif"));
        let optimized = derivation.optimized.unwrap();
        assert_eq!(optimized.extension, "jpg");
        match optimized.data {
            ArtifactData::Memory(bytes) => assert!(bytes.starts_with(&[0xFF, 0xD8])),
            ArtifactData::File(_) => panic!("image artifacts stay in memory"),
        }
    }

    #[tokio::test]
    async fn test_rejects_non_image_content() {
        let err = ImageDeriver::new(300)
            .derive(input(b"MZ\x90\0 definitely not a png".to_vec(), "fake.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnsupportedKind(_)));
    }

    #[tokio::test]
    async fn test_truncated_image_is_decode_failure() {
        let mut data = png_bytes(16, 16);
        data.truncate(40);
        let err = ImageDeriver::new(300)
            .derive(input(data, "broken.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DecodeFailed(_)));
    }
}
