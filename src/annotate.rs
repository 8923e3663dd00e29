//! Frame annotation and encoding for delivery.
//!
//! Boxes are drawn in class colours (green for protective equipment, red for
//! violations, grey for everything else) and the result is JPEG-encoded and
//! base64-wrapped for the `frame` message.

use std::collections::BTreeSet;
use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detect::classes;
use crate::detect::Detection;
use crate::error::{Result, SentinelError};
use crate::frame::Frame;

const POSITIVE_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const VIOLATION_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const NEUTRAL_COLOR: Rgb<u8> = Rgb([160, 160, 160]);
const BOX_THICKNESS: i64 = 2;

/// JPEG payload of one delivered frame.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    /// Base64 (standard alphabet) JPEG bytes.
    pub image: String,
    pub width: u32,
    pub height: u32,
}

pub fn box_color(class_name: &str) -> Rgb<u8> {
    if classes::is_violation(class_name) {
        VIOLATION_COLOR
    } else if classes::is_positive(class_name) {
        POSITIVE_COLOR
    } else {
        NEUTRAL_COLOR
    }
}

/// Detections the client asked to see.
///
/// `None` shows everything. Selecting a positive class also shows its
/// negative counterpart.
pub fn visible_detections(
    detections: &[Detection],
    selected: Option<&BTreeSet<String>>,
) -> Vec<Detection> {
    match selected {
        None => detections.to_vec(),
        Some(selected) => {
            let shown = classes::expand_selection(selected);
            detections
                .iter()
                .filter(|d| shown.contains(&d.class_name))
                .cloned()
                .collect()
        }
    }
}

pub fn draw_boxes(image: &mut RgbImage, detections: &[Detection]) {
    let (width, height) = image.dimensions();
    for detection in detections {
        let bbox = detection.bbox.clamped(width, height);
        let color = box_color(&detection.class_name);
        for inset in 0..BOX_THICKNESS {
            let w = bbox.width() - 2 * inset;
            let h = bbox.height() - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(bbox.x1 + inset as i32, bbox.y1 + inset as i32)
                .of_size(w as u32, h as u32);
            draw_hollow_rect_mut(image, rect, color);
        }
    }
}

pub fn encode_jpeg_base64(image: &RgbImage, quality: u8) -> Result<String> {
    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|e| SentinelError::Encode(format!("jpeg encode: {}", e)))?;
    Ok(STANDARD.encode(buffer.into_inner()))
}

/// Annotate (when `show_boxes`) and encode one frame.
pub fn render(
    frame: &Frame,
    detections: &[Detection],
    show_boxes: bool,
    quality: u8,
) -> Result<EncodedFrame> {
    let mut image = frame.to_rgb_image()?;
    if show_boxes {
        draw_boxes(&mut image, detections);
    }
    Ok(EncodedFrame {
        image: encode_jpeg_base64(&image, quality)?,
        width: frame.width,
        height: frame.height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    fn det(class_name: &str) -> Detection {
        Detection::new(class_name, 0.9, BoundingBox::new(2, 2, 12, 12))
    }

    #[test]
    fn colours_follow_class_kind() {
        assert_eq!(box_color("Hardhat"), POSITIVE_COLOR);
        assert_eq!(box_color("NO-Hardhat"), VIOLATION_COLOR);
        assert_eq!(box_color("vehicle"), NEUTRAL_COLOR);
    }

    #[test]
    fn selecting_positive_class_shows_its_violation() {
        let all = vec![det("Hardhat"), det("NO-Hardhat"), det("NO-Mask"), det("Person")];
        let selected: BTreeSet<String> = ["Hardhat".to_string()].into_iter().collect();
        let shown: Vec<String> = visible_detections(&all, Some(&selected))
            .into_iter()
            .map(|d| d.class_name)
            .collect();
        assert_eq!(shown, vec!["Hardhat", "NO-Hardhat"]);
        assert_eq!(visible_detections(&all, None).len(), 4);
    }

    #[test]
    fn boxes_are_drawn_in_class_colour() {
        let frame = Frame::filled(20, 20, [0, 0, 0]).unwrap();
        let mut image = frame.to_rgb_image().unwrap();
        draw_boxes(&mut image, &[det("NO-Hardhat")]);
        assert_eq!(*image.get_pixel(2, 2), VIOLATION_COLOR);
        assert_eq!(*image.get_pixel(7, 7), Rgb([0, 0, 0]));
    }

    #[test]
    fn render_produces_base64_jpeg() {
        let frame = Frame::filled(16, 8, [10, 20, 30]).unwrap();
        let encoded = render(&frame, &[det("Person")], true, 70).unwrap();
        assert_eq!((encoded.width, encoded.height), (16, 8));
        let bytes = STANDARD.decode(encoded.image).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
