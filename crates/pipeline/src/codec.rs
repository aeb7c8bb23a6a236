//! Decoding staged page files into pixels and encoding upscaled pixels back
//! into the page's own file format.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageEncoder, ImageFormat, ImageReader, ImageResult, RgbaImage};
use std::io::Cursor;
use std::path::Path;

/// Entries with these extensions are upscaled; everything else is carried
/// into the output archive unchanged.
pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "gif", "webp"];

// Resource-fork debris from archives created on macOS.
const MACOS_METADATA_DIR: &str = "__MACOSX";

/// Whether the archive entry at `path` is a page image.
pub fn is_image_entry(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || path.components().any(|c| c.as_os_str() == MACOS_METADATA_DIR) {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
}

/// How a page was stored, so it can be written back the same way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageEncoding {
    pub format: ImageFormat,
    pub grayscale: bool,
    pub alpha: bool,
}

/// Decode a page. The format is detected from the content, falling back to
/// the entry's extension.
pub fn decode(entry: &Path, data: &[u8]) -> ImageResult<(RgbaImage, PageEncoding)> {
    let mut reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
    let format = match reader.format() {
        Some(format) => format,
        None => {
            let format = ImageFormat::from_path(entry)?;
            reader.set_format(format);
            format
        },
    };
    let image = reader.decode()?;
    let color = image.color();
    let encoding = PageEncoding { format, grayscale: !color.has_color(), alpha: color.has_alpha() };
    Ok((image.into_rgba8(), encoding))
}

/// Encode an upscaled page with its original encoding. Grayscale pages stay
/// grayscale wherever the format can express it.
pub fn encode(image: RgbaImage, encoding: PageEncoding, jpeg_quality: u8) -> ImageResult<Vec<u8>> {
    let image = DynamicImage::ImageRgba8(image);
    let mut buffer = Vec::new();
    if encoding.format == ImageFormat::Jpeg {
        // JPEG has no alpha channel.
        let image = if encoding.grayscale { DynamicImage::ImageLuma8(image.to_luma8()) } else { DynamicImage::ImageRgb8(image.to_rgb8()) };
        JpegEncoder::new_with_quality(&mut buffer, jpeg_quality).write_image(
            image.as_bytes(),
            image.width(),
            image.height(),
            image.color().into(),
        )?;
        return Ok(buffer);
    }
    let keeps_grayscale = matches!(encoding.format, ImageFormat::Png | ImageFormat::Bmp);
    let image = match (encoding.grayscale && keeps_grayscale, encoding.alpha || encoding.format == ImageFormat::Gif) {
        (true, true) => DynamicImage::ImageLumaA8(image.to_luma_alpha8()),
        (true, false) => DynamicImage::ImageLuma8(image.to_luma8()),
        (false, true) => image,
        (false, false) => DynamicImage::ImageRgb8(image.to_rgb8()),
    };
    image.write_to(&mut Cursor::new(&mut buffer), encoding.format)?;
    Ok(buffer)
}
