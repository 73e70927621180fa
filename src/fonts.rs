use std::path::Path;
use std::sync::Arc;
use ab_glyph::{Font as _, FontVec, GlyphId, PxScale, ScaleFont, point};
use anyhow::{anyhow, Context};
use image::{Rgb, RgbImage};
use log::info;

/// Something that can measure and draw a line of text.
pub trait Typeface: Send + Sync {
    /// Width and height of the text box at `px` pixels font size.
    fn measure(&self, text: &str, px: f32) -> (u32, u32);
    /// Draws with the top left corner of the text box at `(x, y)`.
    fn draw(&self, canvas: &mut RgbImage, x: i32, y: i32, text: &str, px: f32, color: Rgb<u8>);
}

/// A typeface at a fixed size.
#[derive(Clone)]
pub struct SizedFont {
    pub face: Arc<dyn Typeface>,
    pub px: f32,
}

impl SizedFont {
    pub fn new(face: Arc<dyn Typeface>, px: f32) -> Self {
        Self { face, px }
    }
    pub fn measure(&self, text: &str) -> (u32, u32) {
        self.face.measure(text, self.px)
    }
    pub fn draw(&self, canvas: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>) {
        self.face.draw(canvas, x, y, text, self.px, color)
    }
}

fn blend(canvas: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>, coverage: f32) {
    if x < 0 || y < 0 || x >= canvas.width() as i32 || y >= canvas.height() as i32 {
        return;
    }
    let coverage = coverage.clamp(0.0, 1.0);
    let px = canvas.get_pixel_mut(x as u32, y as u32);
    for (dst, src) in px.0.iter_mut().zip(color.0) {
        *dst = (*dst as f32 * (1.0 - coverage) + src as f32 * coverage).round() as u8;
    }
}

pub struct TrueTypeFace {
    font: FontVec,
}

impl TrueTypeFace {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Cannot read font file {}", path.to_string_lossy()))?;
        let font = FontVec::try_from_vec(data)
            .map_err(|e| anyhow!("Invalid font file {}: {e}", path.to_string_lossy()))?;
        info!("Loaded font {}", path.to_string_lossy());
        Ok(Self { font })
    }

    // Glyph ids with their pen x offsets, plus the total advance.
    fn layout(&self, text: &str, px: f32) -> (Vec<(GlyphId, f32)>, f32) {
        let scaled = self.font.as_scaled(PxScale::from(px));
        let mut caret = 0.0;
        let mut prev: Option<GlyphId> = None;
        let mut glyphs = Vec::new();
        for c in text.chars() {
            let id = scaled.glyph_id(c);
            if let Some(prev) = prev {
                caret += scaled.kern(prev, id);
            }
            glyphs.push((id, caret));
            caret += scaled.h_advance(id);
            prev = Some(id);
        }
        (glyphs, caret)
    }
}

impl Typeface for TrueTypeFace {
    fn measure(&self, text: &str, px: f32) -> (u32, u32) {
        let scaled = self.font.as_scaled(PxScale::from(px));
        let (_, width) = self.layout(text, px);
        (width.ceil() as u32, (scaled.ascent() - scaled.descent()).ceil() as u32)
    }

    fn draw(&self, canvas: &mut RgbImage, x: i32, y: i32, text: &str, px: f32, color: Rgb<u8>) {
        let scale = PxScale::from(px);
        let baseline = y as f32 + self.font.as_scaled(scale).ascent();
        let (glyphs, _) = self.layout(text, px);
        for (id, offset) in glyphs {
            let glyph = id.with_scale_and_position(scale, point(x as f32 + offset, baseline));
            let Some(outlined) = self.font.outline_glyph(glyph) else {
                continue;
            };
            let bounds = outlined.px_bounds();
            outlined.draw(|gx, gy, coverage| {
                blend(canvas, bounds.min.x as i32 + gx as i32, bounds.min.y as i32 + gy as i32, color, coverage);
            });
        }
    }
}

const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;

/// Built-in 5x7 upper case face scaled by whole pixels. Letters outside its set
/// are folded to the nearest one it has.
pub struct BitmapFace {
    pub bold: bool,
}

impl BitmapFace {
    fn scale(px: f32) -> u32 {
        ((px / (GLYPH_H + 1) as f32).round() as u32).max(1)
    }
}

impl Typeface for BitmapFace {
    fn measure(&self, text: &str, px: f32) -> (u32, u32) {
        let s = Self::scale(px);
        let n = text.chars().count() as u32;
        if n == 0 {
            return (0, GLYPH_H * s);
        }
        let extra = if self.bold { 1 } else { 0 };
        (n * (GLYPH_W + 1) * s - s + extra, GLYPH_H * s)
    }

    fn draw(&self, canvas: &mut RgbImage, x: i32, y: i32, text: &str, px: f32, color: Rgb<u8>) {
        let s = Self::scale(px) as i32;
        let strikes = if self.bold { 2 } else { 1 };
        for (ix, c) in text.chars().enumerate() {
            let rows = glyph(fold(c));
            let gx = x + ix as i32 * (GLYPH_W as i32 + 1) * s;
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..GLYPH_W as i32 {
                    if bits & (1 << (GLYPH_W as i32 - 1 - col)) == 0 {
                        continue;
                    }
                    for strike in 0..strikes {
                        for dy in 0..s {
                            for dx in 0..s {
                                blend(canvas, gx + col * s + dx + strike, y + row as i32 * s + dy, color, 1.0);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn fold(c: char) -> char {
    match c.to_uppercase().next().unwrap_or(c) {
        'Á' | 'À' | 'Â' | 'Ä' | 'Ã' => 'A',
        'É' | 'È' | 'Ê' | 'Ë' => 'E',
        'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
        'Ó' | 'Ò' | 'Ô' | 'Ö' | 'Õ' => 'O',
        'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
        'Ñ' => 'N',
        'Ç' => 'C',
        other => other,
    }
}

fn glyph(c: char) -> [u8; 7] {
    match c {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        ' ' => [0; 7],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '+' => [0x00, 0x04, 0x04, 0x1F, 0x04, 0x04, 0x00],
        '(' => [0x02, 0x04, 0x08, 0x08, 0x08, 0x04, 0x02],
        ')' => [0x08, 0x04, 0x02, 0x02, 0x02, 0x04, 0x08],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        ',' => [0x00, 0x00, 0x00, 0x00, 0x0C, 0x04, 0x08],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '\'' => [0x0C, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00],
        '&' => [0x0C, 0x12, 0x14, 0x08, 0x15, 0x12, 0x0D],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        _ => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04],
    }
}

/// Configured font file, or the built-in face when none is set.
pub fn load_face(path: Option<&Path>, bold: bool) -> anyhow::Result<Arc<dyn Typeface>> {
    match path {
        Some(path) => Ok(Arc::new(TrueTypeFace::load(path)?)),
        None => Ok(Arc::new(BitmapFace { bold })),
    }
}
