//! Image codec boundary.

use base64::{engine::general_purpose, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{ExtendedColorType, ImageEncoder as _, ImageReader};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Decoded output image, 8-bit RGB, row-major, top row first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl Image {
    pub fn new(width: u32, height: u32, rgb: Vec<u8>) -> anyhow::Result<Self> {
        let expected = width as usize * height as usize * 3;
        if width == 0 || height == 0 {
            anyhow::bail!("image dimensions must be non-zero, got {width}x{height}");
        }
        if rgb.len() != expected {
            anyhow::bail!(
                "pixel buffer is {} bytes, {width}x{height} RGB needs {expected}",
                rgb.len()
            );
        }
        Ok(Self { width, height, rgb })
    }
}

/// Encodes an output image into a named wire format.
pub trait ImageEncoder: Send + Sync {
    /// Format tag used in `data:image/<format>` URIs
    fn format(&self) -> &str;

    fn encode(&self, image: &Image) -> anyhow::Result<Vec<u8>>;
}

/// How results travel back over the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Raw encoded bytes, one binary message per image
    #[default]
    Binary,
    /// JSON object with a `data:` URI and timing metadata
    DataUri,
}

/// Wire format of result images
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Lossless WebP
    #[default]
    Webp,
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }
}

/// Encoder backed by the `image` codecs
#[derive(Debug, Clone, Copy)]
pub struct FormatEncoder {
    format: ImageFormat,
    jpeg_quality: u8,
}

impl FormatEncoder {
    pub fn new(format: ImageFormat) -> Self {
        Self {
            format,
            jpeg_quality: 90,
        }
    }
}

impl ImageEncoder for FormatEncoder {
    fn format(&self) -> &str {
        self.format.as_str()
    }

    fn encode(&self, image: &Image) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        let (w, h, rgb) = (image.width, image.height, image.rgb.as_slice());
        match self.format {
            ImageFormat::Webp => {
                WebPEncoder::new_lossless(&mut out).write_image(rgb, w, h, ExtendedColorType::Rgb8)?
            }
            ImageFormat::Png => {
                PngEncoder::new_with_quality(&mut out, CompressionType::Best, FilterType::Adaptive)
                    .write_image(rgb, w, h, ExtendedColorType::Rgb8)?
            }
            ImageFormat::Jpeg => JpegEncoder::new_with_quality(&mut out, self.jpeg_quality)
                .write_image(rgb, w, h, ExtendedColorType::Rgb8)?,
        }
        Ok(out)
    }
}

pub fn data_uri(format: &str, bytes: &[u8]) -> String {
    format!(
        "data:image/{};base64,{}",
        format,
        general_purpose::STANDARD.encode(bytes)
    )
}

/// Payload bytes of a base64 `data:` URI; `None` for anything else.
pub fn data_uri_bytes(uri: &str) -> Option<Vec<u8>> {
    let rest = uri.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    if !meta.ends_with(";base64") {
        return None;
    }
    general_purpose::STANDARD.decode(payload.trim()).ok()
}

/// Width and height from an encoded image's header, without decoding pixels.
pub fn encoded_dimensions(bytes: &[u8]) -> anyhow::Result<(u32, u32)> {
    Ok(ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    // soft horizontal bands, like a preview frame
    fn banded(width: u32, height: u32) -> Image {
        let mut rgb = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            let shade = (y * 8 / height * 30) as u8;
            for _ in 0..width {
                rgb.extend_from_slice(&[shade, 255 - shade, 128]);
            }
        }
        Image::new(width, height, rgb).unwrap()
    }

    #[test]
    fn test_image_rejects_bad_buffer() {
        assert!(Image::new(2, 2, vec![0; 12]).is_ok());
        assert!(Image::new(2, 2, vec![0; 11]).is_err());
        assert!(Image::new(0, 2, vec![]).is_err());
    }

    #[test]
    fn test_each_format_writes_its_container() {
        let image = banded(64, 32);

        let webp = FormatEncoder::new(ImageFormat::Webp).encode(&image).unwrap();
        assert_eq!(&webp[0..4], b"RIFF");
        assert_eq!(&webp[8..12], b"WEBP");

        let png = FormatEncoder::new(ImageFormat::Png).encode(&image).unwrap();
        assert_eq!(&png[0..8], b"\x89PNG\r\n\x1a\n");

        let jpeg = FormatEncoder::new(ImageFormat::Jpeg).encode(&image).unwrap();
        assert_eq!(&jpeg[0..2], &[0xff, 0xd8]);

        for bytes in [&webp, &png, &jpeg] {
            assert_eq!(encoded_dimensions(bytes).unwrap(), (64, 32));
        }
    }

    #[test]
    fn test_format_tags() {
        assert_eq!(FormatEncoder::new(ImageFormat::default()).format(), "webp");
        assert_eq!(FormatEncoder::new(ImageFormat::Jpeg).format(), "jpeg");
    }

    #[test]
    fn test_data_uri() {
        assert_eq!(data_uri("webp", b"abc"), "data:image/webp;base64,YWJj");
        assert_eq!(
            data_uri_bytes("data:image/webp;base64,YWJj").as_deref(),
            Some(&b"abc"[..])
        );
        assert_eq!(data_uri_bytes("https://example.com/cat.png"), None);
        assert_eq!(data_uri_bytes("data:text/plain,abc"), None);
    }

    #[test]
    fn test_output_mode_names() {
        assert_eq!(
            serde_json::to_string(&OutputMode::DataUri).unwrap(),
            "\"datauri\""
        );
        assert_eq!(OutputMode::default(), OutputMode::Binary);
    }
}
