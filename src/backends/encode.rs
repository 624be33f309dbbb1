//! Page image → base64 PNG `ImageData` for the OCR fallback.
//!
//! PNG rather than JPEG: copyright pages are small print, and JPEG ringing
//! around glyphs is exactly what makes a vision model misread an ISBN digit.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rendered page for a multimodal chat request.
///
/// `detail: "high"` keeps fine print legible for OpenAI-style tiling.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("OCR page {}x{} → {} bytes base64", img.width(), img.height(), b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encodes_valid_png() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 4, Rgba([0, 0, 0, 255])));
        let data = encode_page(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&decoded[1..4], b"PNG");
    }
}
