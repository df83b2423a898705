use std::io::Cursor;

use base64::{engine::general_purpose, Engine as _};
use image::ImageFormat;
use sha2::{Digest, Sha256};

/// Ограничения на входное изображение.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    pub max_bytes: usize,
    pub max_pixels: u64,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_bytes: 20 * 1024 * 1024,
            max_pixels: 20_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub byte_len: usize,
}

impl ImageInfo {
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn size_mb(&self) -> f64 {
        self.byte_len as f64 / (1024.0 * 1024.0)
    }

    pub fn mime(&self) -> &'static str {
        match self.format {
            ImageFormat::Png => "image/png",
            ImageFormat::WebP => "image/webp",
            _ => "image/jpeg",
        }
    }

    pub fn format_name(&self) -> &'static str {
        match self.format {
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Png => "PNG",
            ImageFormat::WebP => "WEBP",
            _ => "OTHER",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image too large: {size_mb:.1}MB (max: {max_mb:.0}MB)")]
    TooLarge { size_mb: f64, max_mb: f64 },

    #[error("not a recognizable image")]
    Unrecognized,

    #[error("unsupported format: {0} (supported: JPEG, PNG, WEBP)")]
    Unsupported(String),

    #[error("image too large: {pixels} pixels (max: {max} pixels)")]
    TooManyPixels { pixels: u64, max: u64 },

    #[error("invalid image file: {0}")]
    Corrupt(String),
}

/// Проверяет размер файла, формат и число пикселей.
/// Декодирование целиком не выполняется: читается только заголовок.
pub fn validate_image(bytes: &[u8], limits: &ImageLimits) -> Result<ImageInfo, ImageError> {
    if bytes.len() > limits.max_bytes {
        return Err(ImageError::TooLarge {
            size_mb: bytes.len() as f64 / (1024.0 * 1024.0),
            max_mb: limits.max_bytes as f64 / (1024.0 * 1024.0),
        });
    }

    let format = image::guess_format(bytes).map_err(|_| ImageError::Unrecognized)?;
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP) {
        return Err(ImageError::Unsupported(format!("{format:?}").to_uppercase()));
    }

    let (width, height) = image::io::Reader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .map_err(|e| ImageError::Corrupt(e.to_string()))?;

    let info = ImageInfo {
        format,
        width,
        height,
        byte_len: bytes.len(),
    };
    if info.pixel_count() > limits.max_pixels {
        return Err(ImageError::TooManyPixels {
            pixels: info.pixel_count(),
            max: limits.max_pixels,
        });
    }
    Ok(info)
}

/// Определяет MIME-тип по сигнатуре изображения.
pub fn guess_mime(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::Png) => "image/png",
        Ok(ImageFormat::WebP) => "image/webp",
        Ok(ImageFormat::Gif) => "image/gif",
        Ok(ImageFormat::Bmp) => "image/bmp",
        _ => "image/jpeg",
    }
}

pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditType {
    TextEdit,
    ColorChange,
    ObjectModification,
    BackgroundChange,
    StyleChange,
    GeneralEdit,
}

impl EditType {
    pub fn as_str(self) -> &'static str {
        match self {
            EditType::TextEdit => "text_edit",
            EditType::ColorChange => "color_change",
            EditType::ObjectModification => "object_modification",
            EditType::BackgroundChange => "background_change",
            EditType::StyleChange => "style_change",
            EditType::GeneralEdit => "general_edit",
        }
    }

    /// Человекочитаемое имя для подписей ("color_change" -> "Color Change").
    pub fn label(self) -> String {
        humanize(self.as_str())
    }
}

pub fn humanize(snake: &str) -> String {
    snake
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

const KEYWORDS: &[(EditType, &[&str])] = &[
    (EditType::TextEdit, &["replace", "text", "word", "letter", "font"]),
    (
        EditType::ColorChange,
        &[
            "color", "colour", "red", "blue", "green", "yellow", "purple", "orange", "pink",
            "black", "white",
        ],
    ),
    (EditType::ObjectModification, &["remove", "delete", "add", "insert", "place"]),
    (EditType::BackgroundChange, &["background", "sky", "scene", "setting"]),
    (EditType::StyleChange, &["style", "artistic", "painting", "sketch", "cartoon"]),
];

/// Substring match on the lowercased prompt; the first matching group wins.
pub fn classify_edit_type(prompt: &str) -> EditType {
    let lower = prompt.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(kind, _)| *kind)
        .unwrap_or(EditType::GeneralEdit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageOutputFormat, RgbImage};

    fn encoded(width: u32, height: u32, format: ImageOutputFormat) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::new(width, height));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).expect("кодирование тестового изображения");
        out.into_inner()
    }

    #[test]
    fn accepts_png_and_reports_dimensions() {
        let bytes = encoded(64, 32, ImageOutputFormat::Png);
        let info = validate_image(&bytes, &ImageLimits::default()).unwrap();
        assert_eq!(info.format, ImageFormat::Png);
        assert_eq!((info.width, info.height), (64, 32));
        assert_eq!(info.pixel_count(), 2048);
        assert_eq!(info.format_name(), "PNG");
        assert_eq!(info.mime(), "image/png");
        assert_eq!(guess_mime(&bytes), "image/png");
    }

    #[test]
    fn accepts_jpeg() {
        let bytes = encoded(16, 16, ImageOutputFormat::Jpeg(90));
        let info = validate_image(&bytes, &ImageLimits::default()).unwrap();
        assert_eq!(info.format, ImageFormat::Jpeg);
    }

    #[test]
    fn rejects_bmp_as_unsupported() {
        let bytes = encoded(8, 8, ImageOutputFormat::Bmp);
        assert!(matches!(
            validate_image(&bytes, &ImageLimits::default()),
            Err(ImageError::Unsupported(_))
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            validate_image(b"definitely not an image", &ImageLimits::default()),
            Err(ImageError::Unrecognized)
        ));
    }

    #[test]
    fn rejects_truncated_header() {
        let bytes = encoded(8, 8, ImageOutputFormat::Png);
        assert!(matches!(
            validate_image(&bytes[..12], &ImageLimits::default()),
            Err(ImageError::Corrupt(_))
        ));
    }

    #[test]
    fn enforces_byte_and_pixel_caps() {
        let bytes = encoded(100, 100, ImageOutputFormat::Png);
        let tight_bytes = ImageLimits { max_bytes: 10, max_pixels: u64::MAX };
        assert!(matches!(
            validate_image(&bytes, &tight_bytes),
            Err(ImageError::TooLarge { .. })
        ));
        let tight_pixels = ImageLimits { max_bytes: usize::MAX, max_pixels: 9_999 };
        match validate_image(&bytes, &tight_pixels) {
            Err(ImageError::TooManyPixels { pixels, max }) => {
                assert_eq!(pixels, 10_000);
                assert_eq!(max, 9_999);
            }
            other => panic!("ожидалась ошибка по пикселям, получено {other:?}"),
        }
    }

    #[test]
    fn classifies_prompts_in_priority_order() {
        assert_eq!(classify_edit_type("Replace 'Hello' with 'Welcome'"), EditType::TextEdit);
        assert_eq!(classify_edit_type("Change the car color to red"), EditType::ColorChange);
        assert_eq!(classify_edit_type("Remove the person"), EditType::ObjectModification);
        assert_eq!(classify_edit_type("Make the sky more dramatic"), EditType::BackgroundChange);
        assert_eq!(classify_edit_type("turn it into a cartoon"), EditType::StyleChange);
        assert_eq!(classify_edit_type("make it better"), EditType::GeneralEdit);
        assert_eq!(EditType::ObjectModification.label(), "Object Modification");
    }

    #[test]
    fn base64_and_hash_helpers() {
        assert_eq!(encode_base64(b"hi"), "aGk=");
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
