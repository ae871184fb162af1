//! Image-processing backend: metadata probing, resize-to-width and
//! per-format encoding on top of the `image` crate.
//!
//! Encoding is CPU-bound and runs on the blocking pool. The streaming
//! transform buffers the origin internally up to the caller's cap before
//! transforming (the pure-Rust decoders cannot operate on partial input)
//! and re-chunks the encoded result on the way out.

use crate::errors::{MediaError, MediaResult};
use crate::models::OutputFormat;
use crate::storage::ByteStream;
use bytes::Bytes;
use futures::{SinkExt, StreamExt, channel::mpsc};
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder, ImageFormat, ImageReader};
use std::io::{self, Cursor};

/// Fixed encode quality for jpeg variants.
pub const JPEG_QUALITY: u8 = 80;
/// Fixed encode quality for avif variants.
pub const AVIF_QUALITY: u8 = 70;
/// Encoder effort for avif; 1 is slowest/best, 10 fastest.
const AVIF_SPEED: u8 = 6;
/// Output chunk size for the streaming transform.
const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// Read pixel dimensions from the image header without decoding pixels.
pub fn probe_dimensions(bytes: &[u8]) -> MediaResult<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| MediaError::InvalidImage(err.to_string()))?
        .into_dimensions()
        .map_err(|err| MediaError::InvalidImage(err.to_string()))
}

/// Pixel width of the encoded image.
pub fn probe_width(bytes: &[u8]) -> MediaResult<u32> {
    probe_dimensions(bytes).map(|(width, _)| width)
}

/// Clamp a requested width to the source's pixel width when upscale
/// prevention is on; pass it through unchanged otherwise.
pub fn clamp_target_width(bytes: &[u8], requested: u32, prevent_upscale: bool) -> MediaResult<u32> {
    if !prevent_upscale {
        return Ok(requested);
    }
    Ok(requested.min(probe_width(bytes)?))
}

/// Resize to `target_width` preserving aspect ratio and encode per
/// `format`. A no-op resize in `Original` format returns the input bytes
/// untouched.
pub async fn resize_to_width(
    bytes: Bytes,
    target_width: u32,
    format: OutputFormat,
) -> MediaResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || encode_sync(&bytes, target_width, format))
        .await
        .map_err(|err| MediaError::InvalidImage(format!("resize worker failed: {err}")))?
}

fn encode_sync(bytes: &[u8], target_width: u32, format: OutputFormat) -> MediaResult<Vec<u8>> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| MediaError::InvalidImage(err.to_string()))?;
    let source_format = reader
        .format()
        .ok_or_else(|| MediaError::InvalidImage("unrecognized image format".into()))?;
    let img = reader
        .decode()
        .map_err(|err| MediaError::InvalidImage(err.to_string()))?;
    let (src_width, src_height) = img.dimensions();

    if format == OutputFormat::Original && target_width == src_width {
        return Ok(bytes.to_vec());
    }

    let resized = if target_width == src_width {
        img
    } else {
        let target_height =
            ((src_height as u64 * target_width as u64) / src_width as u64).max(1) as u32;
        img.resize_exact(target_width, target_height, FilterType::Lanczos3)
    };

    encode(resized, source_format, format)
}

fn encode(
    img: DynamicImage,
    source_format: ImageFormat,
    format: OutputFormat,
) -> MediaResult<Vec<u8>> {
    let mut out = Vec::new();
    match format {
        OutputFormat::Jpeg => {
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
                .encode(
                    rgb.as_raw(),
                    rgb.width(),
                    rgb.height(),
                    ExtendedColorType::Rgb8,
                )
                .map_err(|err| MediaError::InvalidImage(err.to_string()))?;
        }
        OutputFormat::Webp => {
            // The image crate's webp encoder is lossless-only.
            let rgba = img.to_rgba8();
            WebPEncoder::new_lossless(&mut out)
                .encode(
                    rgba.as_raw(),
                    rgba.width(),
                    rgba.height(),
                    ExtendedColorType::Rgba8,
                )
                .map_err(|err| MediaError::InvalidImage(err.to_string()))?;
        }
        OutputFormat::Avif => {
            let rgba = img.to_rgba8();
            AvifEncoder::new_with_speed_quality(&mut out, AVIF_SPEED, AVIF_QUALITY)
                .write_image(
                    rgba.as_raw(),
                    rgba.width(),
                    rgba.height(),
                    ExtendedColorType::Rgba8,
                )
                .map_err(|err| MediaError::InvalidImage(err.to_string()))?;
        }
        OutputFormat::Original => {
            img.write_to(&mut Cursor::new(&mut out), source_format)
                .map_err(|err| MediaError::InvalidImage(err.to_string()))?;
        }
    }
    Ok(out)
}

/// Pipe an origin stream through the resize/encode transform.
///
/// The result is a stream of encoded chunks; any failure surfaces as a
/// single I/O error item. The input is buffered up to `max_source_bytes`
/// before transforming.
pub fn transform_stream(
    input: ByteStream,
    width: u32,
    format: OutputFormat,
    max_source_bytes: u64,
    prevent_upscale: bool,
) -> ByteStream {
    let (mut tx, rx) = mpsc::channel::<io::Result<Bytes>>(8);
    tokio::spawn(async move {
        match buffer_and_transform(input, width, format, max_source_bytes, prevent_upscale).await {
            Ok(encoded) => {
                for chunk in encoded.chunks(STREAM_CHUNK_BYTES) {
                    if tx.send(Ok(Bytes::copy_from_slice(chunk))).await.is_err() {
                        // consumer went away
                        return;
                    }
                }
            }
            Err(err) => {
                let _ = tx.send(Err(io::Error::other(err.to_string()))).await;
            }
        }
    });
    Box::pin(rx)
}

async fn buffer_and_transform(
    mut input: ByteStream,
    width: u32,
    format: OutputFormat,
    max_source_bytes: u64,
    prevent_upscale: bool,
) -> MediaResult<Vec<u8>> {
    let mut buf = Vec::new();
    while let Some(chunk) = input.next().await {
        let chunk =
            chunk.map_err(|err| MediaError::InvalidImage(format!("reading origin stream: {err}")))?;
        if (buf.len() + chunk.len()) as u64 > max_source_bytes {
            return Err(MediaError::LimitExceeded(format!(
                "origin stream exceeds the {max_source_bytes} byte resize limit"
            )));
        }
        buf.extend_from_slice(&chunk);
    }
    let target = clamp_target_width(&buf, width, prevent_upscale)?;
    resize_to_width(Bytes::from(buf), target, format).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn png_fixture(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([90, 120, 30])));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn probe_reads_dimensions_without_full_decode() {
        let png = png_fixture(200, 100);
        assert_eq!(probe_dimensions(&png).unwrap(), (200, 100));
        assert_eq!(probe_width(&png).unwrap(), 200);
    }

    #[test]
    fn probe_rejects_garbage() {
        assert!(matches!(
            probe_dimensions(b"not an image at all"),
            Err(MediaError::InvalidImage(_))
        ));
    }

    #[test]
    fn clamp_respects_prevention_flag() {
        let png = png_fixture(200, 100);
        assert_eq!(clamp_target_width(&png, 500, true).unwrap(), 200);
        assert_eq!(clamp_target_width(&png, 500, false).unwrap(), 500);
        assert_eq!(clamp_target_width(&png, 120, true).unwrap(), 120);
    }

    #[tokio::test]
    async fn resize_preserves_aspect_ratio() {
        let png = png_fixture(200, 100);
        let out = resize_to_width(Bytes::from(png), 100, OutputFormat::Original)
            .await
            .unwrap();
        assert_eq!(probe_dimensions(&out).unwrap(), (100, 50));
    }

    #[tokio::test]
    async fn same_width_original_is_a_passthrough() {
        let png = png_fixture(200, 100);
        let out = resize_to_width(Bytes::from(png.clone()), 200, OutputFormat::Original)
            .await
            .unwrap();
        assert_eq!(out, png);
    }

    #[tokio::test]
    async fn jpeg_encode_produces_jpeg_bytes() {
        let png = png_fixture(64, 64);
        let out = resize_to_width(Bytes::from(png), 32, OutputFormat::Jpeg)
            .await
            .unwrap();
        let guessed = ImageReader::new(Cursor::new(&out))
            .with_guessed_format()
            .unwrap()
            .format();
        assert_eq!(guessed, Some(ImageFormat::Jpeg));
    }

    #[tokio::test]
    async fn webp_encode_produces_webp_bytes() {
        let png = png_fixture(64, 64);
        let out = resize_to_width(Bytes::from(png), 32, OutputFormat::Webp)
            .await
            .unwrap();
        let guessed = ImageReader::new(Cursor::new(&out))
            .with_guessed_format()
            .unwrap()
            .format();
        assert_eq!(guessed, Some(ImageFormat::WebP));
    }

    fn single_chunk_stream(bytes: Vec<u8>) -> ByteStream {
        let chunks: Vec<io::Result<Bytes>> = vec![Ok(Bytes::from(bytes))];
        Box::pin(futures::stream::iter(chunks))
    }

    #[tokio::test]
    async fn transform_stream_resizes_and_chunks() {
        let png = png_fixture(200, 100);
        let input = single_chunk_stream(png);
        let mut out = transform_stream(input, 100, OutputFormat::Original, 1 << 20, true);

        let mut encoded = Vec::new();
        while let Some(chunk) = out.next().await {
            encoded.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(probe_dimensions(&encoded).unwrap(), (100, 50));
    }

    #[tokio::test]
    async fn transform_stream_enforces_source_cap() {
        let png = png_fixture(200, 100);
        let input = single_chunk_stream(png);
        let mut out = transform_stream(input, 100, OutputFormat::Original, 16, true);

        let err = out.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("16 byte"));
    }
}
