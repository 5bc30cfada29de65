//! Frame annotation: detection boxes, labels, banners, error frames, JPEG.
//!
//! Text uses a built-in 5x7 bitmap font so rendering needs no font files.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detect::Detection;

pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
pub const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

pub const ERROR_FRAME_WIDTH: u32 = 640;
pub const ERROR_FRAME_HEIGHT: u32 = 480;

const BOX_THICKNESS: i32 = 2;
const GLYPH_W: i32 = 5;
const GLYPH_H: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;

/// Per-class overlay colour.
pub fn class_color(class_name: &str) -> Rgb<u8> {
    match class_name {
        "person" => Rgb([0, 255, 0]),
        "car" => Rgb([255, 0, 0]),
        "animal" => Rgb([0, 0, 255]),
        _ => WHITE,
    }
}

/// Draw a box and a `<class>: <confidence>` label for every detection.
pub fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
    for det in detections {
        let color = class_color(&det.class_name);
        let [x1, y1, x2, y2] = det.bbox.map(|v| v.round() as i32);
        draw_box(image, x1, y1, x2, y2, color);

        let label = format!("{}: {:.2}", det.class_name, det.confidence);
        let label_y = (y1 - 10 - GLYPH_H).max(0);
        draw_text(image, x1.max(0), label_y, &label, color, 1);
    }
}

/// Hollow rectangle `BOX_THICKNESS` pixels wide, clipped to the image.
pub fn draw_box(image: &mut RgbImage, x1: i32, y1: i32, x2: i32, y2: i32, color: Rgb<u8>) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
        return;
    }
    for inset in 0..BOX_THICKNESS {
        let left = (x1 + inset).clamp(0, w - 1);
        let top = (y1 + inset).clamp(0, h - 1);
        let right = (x2 - inset).clamp(0, w - 1);
        let bottom = (y2 - inset).clamp(0, h - 1);
        if right < left || bottom < top {
            break;
        }
        let rect = Rect::at(left, top).of_size((right - left + 1) as u32, (bottom - top + 1) as u32);
        draw_hollow_rect_mut(image, rect, color);
    }
}

/// Render `text` at `(x, y)` (top-left), each font pixel drawn as a
/// `scale` x `scale` block. Lowercase is drawn as uppercase.
pub fn draw_text(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>, scale: u32) {
    let scale = scale.max(1) as i32;
    let (w, h) = (image.width() as i32, image.height() as i32);
    let mut pen_x = x;
    for ch in text.chars().flat_map(char::to_uppercase) {
        let glyph = glyph_bits(ch);
        for (row, pattern) in glyph.iter().enumerate() {
            for col in 0..GLYPH_W {
                if (pattern >> (GLYPH_W - 1 - col)) & 1 == 0 {
                    continue;
                }
                let px = pen_x + col * scale;
                let py = y + row as i32 * scale;
                if px >= w || py >= h || px + scale <= 0 || py + scale <= 0 {
                    continue;
                }
                let left = px.max(0);
                let top = py.max(0);
                let rect = Rect::at(left, top).of_size(
                    (px + scale).min(w).saturating_sub(left).max(1) as u32,
                    (py + scale).min(h).saturating_sub(top).max(1) as u32,
                );
                draw_filled_rect_mut(image, rect, color);
            }
        }
        pen_x += GLYPH_ADVANCE * scale;
    }
}

/// Pixel width of `text` at `scale`.
pub fn text_width(text: &str, scale: u32) -> u32 {
    text.chars().count() as u32 * GLYPH_ADVANCE as u32 * scale.max(1)
}

/// Text on a black strip along the top edge.
pub fn draw_banner(image: &mut RgbImage, text: &str) {
    let scale = 2;
    let strip_h = (GLYPH_H as u32 * scale + 8).min(image.height());
    let strip_w = (text_width(text, scale) + 12).min(image.width());
    if strip_h == 0 || strip_w == 0 {
        return;
    }
    draw_filled_rect_mut(image, Rect::at(0, 0).of_size(strip_w, strip_h), BLACK);
    draw_text(image, 6, 4, text, WHITE, scale);
}

/// 640x480 black frame with `message` in white, used in place of video.
pub fn error_frame(message: &str) -> RgbImage {
    let mut image = RgbImage::from_pixel(ERROR_FRAME_WIDTH, ERROR_FRAME_HEIGHT, BLACK);
    let scale = 2;
    let max_chars = ((ERROR_FRAME_WIDTH - 100) / (GLYPH_ADVANCE as u32 * scale)) as usize;
    let lines = wrap(message, max_chars.max(1));
    let line_h = (GLYPH_H + 4) * scale as i32;
    let mut y = ERROR_FRAME_HEIGHT as i32 / 2 - (lines.len() as i32 * line_h) / 2;
    for line in lines {
        draw_text(&mut image, 50, y, &line, WHITE, scale);
        y += line_h;
    }
    image
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .context("JPEG encode failed")?;
    Ok(buffer)
}

fn wrap(message: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in message.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > max_chars {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

fn glyph_bits(ch: char) -> [u8; 7] {
    match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
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
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
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
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '|' => [0b00100; 7],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        '#' => [0b01010, 0b01010, 0b11111, 0b01010, 0b11111, 0b01010, 0b01010],
        '/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
        ' ' => [0; 7],
        _ => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0, 0b00100],
    }
}
