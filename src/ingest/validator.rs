use std::io::Cursor;

use image::ImageReader;

/// Structural check: the buffer sniffs as a known image format and its header
/// decodes to non-zero dimensions. Pixel data is not inspected.
pub fn validate(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }

    let reader = match ImageReader::new(Cursor::new(bytes)).with_guessed_format() {
        Ok(r) => r,
        Err(_) => return false,
    };
    if reader.format().is_none() {
        return false;
    }

    match reader.into_dimensions() {
        Ok((w, h)) => w > 0 && h > 0,
        Err(e) => {
            tracing::debug!("Validator: header decode failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([120, 60, 30]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_png() {
        assert!(validate(&png_bytes(4, 3)));
    }

    #[test]
    fn test_empty_buffer() {
        assert!(!validate(&[]));
    }

    #[test]
    fn test_html_page_is_rejected() {
        // Drive serves an HTML interstitial when the confirm parameter is missing
        let html = b"<!DOCTYPE html><html><body>Google Drive - Virus scan warning</body></html>";
        assert!(!validate(html));
    }

    #[test]
    fn test_truncated_header_is_rejected() {
        let png = png_bytes(4, 4);
        assert!(!validate(&png[..12]));
    }
}
