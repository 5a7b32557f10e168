//! Raw capture buffer → RGB conversion.

use image::RgbImage;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("MJPEG decode failed: {0}")]
    Decode(String),
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            format: "YUYV",
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (u, v) = (chunk[1], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(chunk[0], u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(chunk[2], u, v));
    }
    buffer(rgb, width, height, "YUYV")
}

/// Replicate an 8-bit grayscale buffer into three channels.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height) as usize;
    if gray.len() < expected {
        return Err(FrameError::InvalidLength {
            format: "GREY",
            expected,
            actual: gray.len(),
        });
    }
    let rgb = gray[..expected].iter().flat_map(|&y| [y, y, y]).collect();
    buffer(rgb, width, height, "GREY")
}

/// Decode one motion-JPEG frame.
pub fn mjpeg_to_rgb(data: &[u8]) -> Result<RgbImage, FrameError> {
    image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| FrameError::Decode(e.to_string()))
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as f32 - 16.0) * 1.164;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [
        clamp(c + 1.596 * e),
        clamp(c - 0.392 * d - 0.813 * e),
        clamp(c + 2.017 * d),
    ]
}

fn buffer(rgb: Vec<u8>, width: u32, height: u32, format: &'static str) -> Result<RgbImage, FrameError> {
    let actual = rgb.len();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        format,
        expected: (width * height * 3) as usize,
        actual,
    })
}
