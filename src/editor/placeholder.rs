//! Placeholder images standing in for uploads that are still running.
//!
//! The document only knows image nodes, so progress is drawn into the pixels
//! of a small PNG and handed over as a `data:` URI.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageError, Rgba, RgbaImage};
use tracing::warn;

pub trait PlaceholderRenderer: Send + Sync {
    /// Image URI showing `percent` (0-100) and a short label.
    fn render(&self, percent: u8, label: &str) -> String;

    /// Image URI for a failed upload.
    fn render_failed(&self) -> String {
        self.render(0, "UPLOAD FAILED")
    }
}

const BACKGROUND: Rgba<u8> = Rgba([0xf3, 0xf4, 0xf6, 0xff]);
const BORDER: Rgba<u8> = Rgba([0xd1, 0xd5, 0xdb, 0xff]);
const TRACK: Rgba<u8> = Rgba([0xe5, 0xe7, 0xeb, 0xff]);
const FILL: Rgba<u8> = Rgba([0x25, 0x63, 0xeb, 0xff]);
const TEXT: Rgba<u8> = Rgba([0x37, 0x41, 0x51, 0xff]);
const FAILED: Rgba<u8> = Rgba([0xdc, 0x26, 0x26, 0xff]);

const PNG_PREFIX: &str = "data:image/png;base64,";

const GLYPH_W: u32 = 3;
const GLYPH_H: usize = 5;

/// 3x5 glyph rows, most significant of the low three bits is the leftmost pixel.
fn glyph(c: char) -> Option<[u8; GLYPH_H]> {
    let rows = match c {
        '0' | 'O' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b111, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b001, 0b001, 0b001],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        '%' => [0b101, 0b001, 0b010, 0b100, 0b101],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        'A' => [0b010, 0b101, 0b111, 0b101, 0b101],
        'D' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'E' => [0b111, 0b100, 0b110, 0b100, 0b111],
        'F' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'G' => [0b011, 0b100, 0b101, 0b101, 0b011],
        'I' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'L' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'N' => [0b101, 0b111, 0b111, 0b101, 0b101],
        'P' => [0b110, 0b101, 0b110, 0b100, 0b100],
        'U' => [0b101, 0b101, 0b101, 0b101, 0b111],
        _ => return None,
    };
    Some(rows)
}

fn fill_rect(img: &mut RgbaImage, x: u32, y: u32, w: u32, h: u32, color: Rgba<u8>) {
    for row in y..(y + h).min(img.height()) {
        for col in x..(x + w).min(img.width()) {
            img.put_pixel(col, row, color);
        }
    }
}

fn stroke_rect(img: &mut RgbaImage, color: Rgba<u8>) {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    fill_rect(img, 0, 0, w, 1, color);
    fill_rect(img, 0, h - 1, w, 1, color);
    fill_rect(img, 0, 0, 1, h, color);
    fill_rect(img, w - 1, 0, 1, h, color);
}

/// Draws `text` centred on `center_x` with its top at `y`.
fn draw_text(img: &mut RgbaImage, text: &str, center_x: u32, y: u32, scale: u32, color: Rgba<u8>) {
    let advance = (GLYPH_W + 1) * scale;
    let width = text.chars().count() as u32 * advance;
    let mut x = center_x.saturating_sub(width / 2);

    for c in text.chars().map(|c| c.to_ascii_uppercase()) {
        if let Some(rows) = glyph(c) {
            for (ry, bits) in rows.iter().enumerate() {
                for rx in 0..GLYPH_W {
                    if bits & (1 << (GLYPH_W - 1 - rx)) != 0 {
                        fill_rect(img, x + rx * scale, y + ry as u32 * scale, scale, scale, color);
                    }
                }
            }
        }
        x += advance;
    }
}

/// Draws a bordered card with a progress bar and a label under it.
#[derive(Debug, Clone)]
pub struct RasterPlaceholder {
    pub width: u32,
    pub height: u32,
}

impl Default for RasterPlaceholder {
    fn default() -> Self {
        Self { width: 240, height: 64 }
    }
}

impl RasterPlaceholder {
    fn draw(&self, percent: u8, label: &str, bar_color: Rgba<u8>) -> RgbaImage {
        let percent = u32::from(percent.min(100));
        let mut img = RgbaImage::from_pixel(self.width, self.height, BACKGROUND);
        stroke_rect(&mut img, BORDER);

        let margin = 12.min(self.width / 4);
        let bar_w = self.width.saturating_sub(2 * margin);
        let bar_h = 8.min(self.height / 4).max(1);
        let bar_y = self.height / 4;
        fill_rect(&mut img, margin, bar_y, bar_w, bar_h, TRACK);
        fill_rect(&mut img, margin, bar_y, bar_w * percent / 100, bar_h, bar_color);

        let scale = if self.height >= 48 { 3 } else { 1 };
        let text_y = bar_y + bar_h + 2 * scale;
        draw_text(&mut img, label, self.width / 2, text_y, scale, TEXT);
        img
    }

    fn encode(img: &RgbaImage) -> Result<Vec<u8>, ImageError> {
        let mut png = Vec::new();
        PngEncoder::new(&mut png).write_image(img.as_raw(), img.width(), img.height(), ExtendedColorType::Rgba8)?;
        Ok(png)
    }

    fn data_uri(img: &RgbaImage) -> String {
        match Self::encode(img) {
            Ok(png) => format!("{PNG_PREFIX}{}", STANDARD.encode(png)),
            Err(e) => {
                warn!("Failed to encode placeholder: {}", e);
                PNG_PREFIX.to_string()
            }
        }
    }

    /// Encoded PNG bytes of the progress card.
    pub fn png(&self, percent: u8, label: &str) -> Result<Vec<u8>, ImageError> {
        Self::encode(&self.draw(percent, label, FILL))
    }
}

impl PlaceholderRenderer for RasterPlaceholder {
    fn render(&self, percent: u8, label: &str) -> String {
        Self::data_uri(&self.draw(percent, label, FILL))
    }

    fn render_failed(&self) -> String {
        Self::data_uri(&self.draw(100, "UPLOAD FAILED", FAILED))
    }
}

/// Label shown while an upload is running.
pub fn progress_label(percent: u8) -> String {
    format!("{}%", percent.min(100))
}
