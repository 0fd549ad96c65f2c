use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, RgbImage};

use crate::BBox;

const JPEG_QUALITY: u8 = 90;

/// Clamps `bbox` to the frame, crops, and JPEG-encodes the result.
pub fn crop_jpeg(frame: &RgbImage, bbox: &BBox) -> Result<Vec<u8>> {
    let (x, y, w, h) = clamp_to_frame(bbox, frame.width(), frame.height()).ok_or_else(|| {
        anyhow!(
            "bbox {:?} has no overlap with {}x{} frame",
            <[i32; 4]>::from(*bbox),
            frame.width(),
            frame.height()
        )
    })?;
    let crop = imageops::crop_imm(frame, x, y, w, h).to_image();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(&crop)
        .context("encode snapshot jpeg")?;
    Ok(out)
}

/// `(x, y, width, height)` of the visible part of `bbox`, or None when empty.
pub fn clamp_to_frame(bbox: &BBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let clamp = |v: i32, max: u32| v.clamp(0, max as i32) as u32;
    let x1 = clamp(bbox.x1, width);
    let y1 = clamp(bbox.y1, height);
    let x2 = clamp(bbox.x2, width);
    let y2 = clamp(bbox.y2, height);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some((x1, y1, x2 - x1, y2 - y1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_partially_visible_boxes() {
        let bbox = BBox::new(-5, 10, 20, 120).unwrap();
        assert_eq!(clamp_to_frame(&bbox, 100, 100), Some((0, 10, 20, 90)));
    }

    #[test]
    fn off_frame_box_is_empty() {
        let bbox = BBox::new(150, 150, 160, 160).unwrap();
        assert_eq!(clamp_to_frame(&bbox, 100, 100), None);
        assert!(crop_jpeg(&RgbImage::new(100, 100), &bbox).is_err());
    }

    #[test]
    fn crop_produces_decodable_jpeg() -> Result<()> {
        let frame = RgbImage::from_pixel(64, 48, image::Rgb([200, 30, 30]));
        let bytes = crop_jpeg(&frame, &BBox::new(8, 8, 24, 40).unwrap())?;
        let decoded = image::load_from_memory(&bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (16, 32));
        Ok(())
    }
}
