use anyhow::{Result, anyhow};
use image::{ImageBuffer, Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use ml_core::Detection;
use video_ingest::Frame;

use crate::vision::hazard::{Hazard, HazardLabels};

const FIRE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const SMOKE_COLOR: Rgb<u8> = Rgb([255, 165, 0]);
const OTHER_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const BOX_THICKNESS: i32 = 2;

pub(crate) fn hazard_color(labels: &HazardLabels, class_label: &str) -> Rgb<u8> {
    match labels.classify(class_label) {
        Some(Hazard::Fire) => FIRE_COLOR,
        Some(Hazard::Smoke) => SMOKE_COLOR,
        None => OTHER_COLOR,
    }
}

pub(crate) fn label_text(detection: &Detection) -> String {
    format!("{} {:.2}", detection.class_label, detection.confidence)
}

/// Draw one box and label per localised detection onto an RGB copy of `frame`.
pub(crate) fn annotate(
    frame: &Frame,
    detections: &[Detection],
    labels: &HazardLabels,
) -> Result<RgbImage> {
    let mut image = frame_to_rgb(frame)?;
    let width = image.width() as i32;
    let height = image.height() as i32;
    let scale = (width / 640).max(1);

    for detection in detections {
        let Some(bbox) = detection.bbox else {
            continue;
        };
        let color = hazard_color(labels, &detection.class_label);
        let left = bbox[0].clamp(0.0, (width - 1) as f32).round() as i32;
        let top = bbox[1].clamp(0.0, (height - 1) as f32).round() as i32;
        let right = bbox[2].clamp(0.0, (width - 1) as f32).round() as i32;
        let bottom = bbox[3].clamp(0.0, (height - 1) as f32).round() as i32;
        for inset in 0..BOX_THICKNESS {
            draw_rectangle(
                &mut image,
                left + inset,
                top + inset,
                right - inset,
                bottom - inset,
                color,
            );
        }

        let text = label_text(detection);
        let text_width = text.chars().count() as i32 * (GLYPH_WIDTH + 1) * scale;
        let text_height = GLYPH_HEIGHT * scale;
        let label_top = if top - text_height - 4 >= 0 {
            top - text_height - 4
        } else {
            top
        };
        fill_rect(
            &mut image,
            left,
            label_top,
            left + text_width + 2,
            label_top + text_height + 3,
            color,
        );
        let ink = if color == OTHER_COLOR {
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 255, 255])
        };
        draw_label(&mut image, left + 2, label_top + 2, &text, ink, scale);
    }

    Ok(image)
}

/// Annotated copy of `frame` in the packed BGR layout expected by video sinks.
pub(crate) fn annotate_frame(
    frame: &Frame,
    detections: &[Detection],
    labels: &HazardLabels,
) -> Result<Frame> {
    let image = annotate(frame, detections, labels)?;
    let mut annotated = Frame::bgr(rgb_to_bgr(image.as_raw()), frame.width, frame.height);
    annotated.timestamp_ms = frame.timestamp_ms;
    Ok(annotated)
}

/// Annotate and JPEG-encode in one step.
pub(crate) fn render_jpeg(
    frame: &Frame,
    detections: &[Detection],
    labels: &HazardLabels,
    quality: u8,
) -> Result<Vec<u8>> {
    let image = annotate(frame, detections, labels)?;
    encode_jpeg(&image, quality)
}

pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

pub(crate) fn frame_to_rgb(frame: &Frame) -> Result<RgbImage> {
    if frame.width <= 0 || frame.height <= 0 || frame.data.len() != frame.expected_len() {
        return Err(anyhow!(
            "frame {}x{} has {} bytes, expected {}",
            frame.width,
            frame.height,
            frame.data.len(),
            frame.expected_len()
        ));
    }
    ImageBuffer::from_raw(
        frame.width as u32,
        frame.height as u32,
        rgb_to_bgr(&frame.data),
    )
    .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))
}

/// Swap the first and third channel of packed 3-byte pixels (works both ways).
pub(crate) fn rgb_to_bgr(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
    }
    output
}

fn draw_rectangle(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    if right < left || bottom < top {
        return;
    }
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>, scale: i32) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            let px = x + col * scale + dx;
                            let py = y + row as i32 * scale + dy;
                            if (0..width).contains(&px) && (0..height).contains(&py) {
                                image.put_pixel(px as u32, py as u32, color);
                            }
                        }
                    }
                }
            }
        }
        x += (GLYPH_WIDTH + 1) * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn black_frame(width: i32, height: i32) -> Frame {
        Frame::bgr(vec![0; (width * height * 3) as usize], width, height)
    }

    #[test]
    fn label_uses_two_decimals() {
        let det = Detection::new("fire", 0.876, None);
        assert_eq!(label_text(&det), "fire 0.88");
    }

    #[test]
    fn colors_follow_hazard_category() {
        let labels = HazardLabels::default();
        assert_eq!(hazard_color(&labels, "fire"), FIRE_COLOR);
        assert_eq!(hazard_color(&labels, "Smoke"), SMOKE_COLOR);
        assert_eq!(hazard_color(&labels, "person"), OTHER_COLOR);
    }

    #[test]
    fn box_is_drawn_in_category_color() {
        let frame = black_frame(64, 64);
        let dets = vec![Detection::new("fire", 0.9, Some([20.0, 30.0, 50.0, 60.0]))];
        let image = annotate(&frame, &dets, &HazardLabels::default()).unwrap();
        assert_eq!(*image.get_pixel(35, 60), FIRE_COLOR);
        assert_eq!(*image.get_pixel(50, 45), FIRE_COLOR);
        assert_eq!(*image.get_pixel(35, 45), Rgb([0, 0, 0]));
    }

    #[test]
    fn detections_without_boxes_leave_frame_untouched() {
        let frame = black_frame(8, 8);
        let dets = vec![Detection::new("smoke", 0.5, None)];
        let image = annotate(&frame, &dets, &HazardLabels::default()).unwrap();
        assert!(image.pixels().all(|px| *px == Rgb([0, 0, 0])));
    }

    #[test]
    fn annotated_frame_keeps_bgr_layout() {
        let frame = black_frame(32, 32);
        let dets = vec![Detection::new("smoke", 0.7, Some([4.0, 20.0, 28.0, 30.0]))];
        let annotated = annotate_frame(&frame, &dets, &HazardLabels::default()).unwrap();
        assert_eq!(annotated.data.len(), frame.data.len());
        let idx = ((30 * 32 + 10) * 3) as usize;
        assert_eq!(&annotated.data[idx..idx + 3], &[0, 165, 255]);
    }

    #[test]
    fn jpeg_output_has_soi_marker() {
        let jpeg = render_jpeg(&black_frame(16, 16), &[], &HazardLabels::default(), 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn rejects_truncated_frames() {
        let mut frame = black_frame(4, 4);
        frame.data.truncate(10);
        assert!(frame_to_rgb(&frame).is_err());
    }

    #[test]
    fn font_covers_class_names() {
        for ch in "FIRE_AND_SMOKE-0.99 WXYZ".chars() {
            assert!(glyph_bits(ch).is_some(), "missing glyph {ch}");
        }
    }
}
