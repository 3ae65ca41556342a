//! Frame annotation and JPEG encoding.
//!
//! Draws detection boxes, the crossing line with its counters, and the
//! containment polygon onto the outgoing frame, then encodes it at the
//! configured JPEG quality. All drawing clamps to the frame bounds.

use anyhow::{anyhow, Result};
use image::{codecs::jpeg::JpegEncoder, ImageBuffer, Rgb};
use video_ingest::Frame;

use crate::{data::DetectionRecord, zones::ZoneState};

const COLOR_PERSON: Rgb<u8> = Rgb([66, 133, 244]);
const COLOR_HELMET: Rgb<u8> = Rgb([255, 165, 0]);
const COLOR_VEST: Rgb<u8> = Rgb([0, 200, 80]);
const COLOR_OTHER: Rgb<u8> = Rgb([0, 255, 0]);
const COLOR_LINE: Rgb<u8> = Rgb([255, 64, 64]);
const COLOR_POLYGON: Rgb<u8> = Rgb([0, 255, 255]);
const COLOR_LABEL_BG: Rgb<u8> = Rgb([16, 16, 16]);

type Canvas = ImageBuffer<Rgb<u8>, Vec<u8>>;

/// Annotate `frame` and return the encoded JPEG bytes.
pub fn annotate_and_encode(
    frame: &Frame,
    detections: &[DetectionRecord],
    zones: &ZoneState,
    jpeg_quality: u8,
) -> Result<Vec<u8>> {
    let rgb = bgr_to_rgb(&frame.data);
    let mut canvas = Canvas::from_vec(frame.width, frame.height, rgb)
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;

    if zones.visible {
        draw_zones(&mut canvas, zones);
    }

    for record in detections {
        let color = class_color(&record.class);
        let bbox = record.bbox.clamp_to(frame.width, frame.height);
        draw_rectangle(
            &mut canvas,
            bbox.left.round() as i32,
            bbox.top.round() as i32,
            bbox.right.round() as i32,
            bbox.bottom.round() as i32,
            color,
        );

        let label = match record.track_id {
            Some(id) => format!(
                "{} {} {:.0}%",
                record.class,
                id,
                record.confidence * 100.0
            ),
            None => format!("{} {:.0}%", record.class, record.confidence * 100.0),
        };
        let label_x = bbox.left.round() as i32;
        let label_y = (bbox.top.round() as i32 - 10).max(0);
        let text_width = label.chars().count() as i32 * 6;
        fill_rect(
            &mut canvas,
            label_x,
            label_y,
            label_x + text_width,
            label_y + 8,
            COLOR_LABEL_BG,
        );
        draw_label(&mut canvas, label_x, label_y, &label, color);
    }

    let mut buffer = Vec::new();
    let quality = jpeg_quality.clamp(1, 100);
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(&canvas)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

fn class_color(class: &str) -> Rgb<u8> {
    match class {
        "person" => COLOR_PERSON,
        "helmet" => COLOR_HELMET,
        "safety_vest" => COLOR_VEST,
        _ => COLOR_OTHER,
    }
}

fn draw_zones(canvas: &mut Canvas, zones: &ZoneState) {
    let line = &zones.line;
    draw_line(
        canvas,
        line.start.0.round() as i32,
        line.start.1.round() as i32,
        line.end.0.round() as i32,
        line.end.1.round() as i32,
        COLOR_LINE,
    );
    let caption = format!("IN {} OUT {}", line.in_count, line.out_count);
    let caption_x = (line.start.0.min(line.end.0).round() as i32).max(0) + 4;
    let caption_y = (line.start.1.min(line.end.1).round() as i32 - 10).max(0);
    draw_label(canvas, caption_x, caption_y, &caption, COLOR_LINE);

    if zones.polygon.len() >= 3 {
        for i in 0..zones.polygon.len() {
            let (x0, y0) = zones.polygon[i];
            let (x1, y1) = zones.polygon[(i + 1) % zones.polygon.len()];
            draw_line(
                canvas,
                x0.round() as i32,
                y0.round() as i32,
                x1.round() as i32,
                y1.round() as i32,
                COLOR_POLYGON,
            );
        }
    }
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
    }
    output
}

fn put_pixel_checked(canvas: &mut Canvas, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
        *canvas.get_pixel_mut(x as u32, y as u32) = color;
    }
}

fn draw_rectangle(canvas: &mut Canvas, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = canvas.width() as i32;
    let height = canvas.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for x in left..=right {
        put_pixel_checked(canvas, x, top, color);
        put_pixel_checked(canvas, x, bottom, color);
    }
    for y in top..=bottom {
        put_pixel_checked(canvas, left, y, color);
        put_pixel_checked(canvas, right, y, color);
    }
}

fn fill_rect(canvas: &mut Canvas, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = canvas.width() as i32;
    let height = canvas.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for y in top..=bottom {
        for x in left..=right {
            put_pixel_checked(canvas, x, y, color);
        }
    }
}

/// Bresenham segment clipped to the canvas.
fn draw_line(canvas: &mut Canvas, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgb<u8>) {
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let (mut x, mut y) = (x0, y0);

    loop {
        put_pixel_checked(canvas, x, y, color);
        if x == x1 && y == y1 {
            break;
        }
        let doubled = 2 * err;
        if doubled >= dy {
            err += dy;
            x += sx;
        }
        if doubled <= dx {
            err += dx;
            y += sy;
        }
    }
}

fn draw_label(canvas: &mut Canvas, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        put_pixel_checked(canvas, x + col, py, color);
                    }
                }
            }
        }
        x += 6;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'A' => Some([
            0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001,
        ]),
        'B' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110,
        ]),
        'C' => Some([
            0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110,
        ]),
        'D' => Some([
            0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110,
        ]),
        'E' => Some([
            0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111,
        ]),
        'F' => Some([
            0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000,
        ]),
        'G' => Some([
            0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01110,
        ]),
        'H' => Some([
            0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001,
        ]),
        'I' => Some([
            0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110,
        ]),
        'L' => Some([
            0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111,
        ]),
        'M' => Some([
            0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001,
        ]),
        'N' => Some([
            0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001,
        ]),
        'O' => Some([
            0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110,
        ]),
        'P' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000,
        ]),
        'R' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001,
        ]),
        'S' => Some([
            0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        'T' => Some([
            0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100,
        ]),
        'U' => Some([
            0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110,
        ]),
        'V' => Some([
            0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100,
        ]),
        'Y' => Some([
            0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100,
        ]),
        '0' => Some([
            0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110,
        ]),
        '1' => Some([
            0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110,
        ]),
        '2' => Some([
            0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111,
        ]),
        '3' => Some([
            0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110,
        ]),
        '4' => Some([
            0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010,
        ]),
        '5' => Some([
            0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        '6' => Some([
            0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110,
        ]),
        '7' => Some([
            0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000,
        ]),
        '8' => Some([
            0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110,
        ]),
        '9' => Some([
            0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100,
        ]),
        '%' => Some([
            0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000,
        ]),
        '_' => Some([0, 0, 0, 0, 0, 0, 0b11111]),
        '.' => Some([0, 0, 0, 0, 0, 0b00110, 0b00110]),
        ' ' => Some([0, 0, 0, 0, 0, 0, 0]),
        _ => None,
    }
}
