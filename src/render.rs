use std::io::Cursor;
use std::path::PathBuf;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use crate::assign::Binding;
use crate::fonts::{load_face, SizedFont};

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum TitleAlign {
    Center,
    /// Left with an underline.
    #[default]
    Left,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    /// Templates are drawn on at this multiple of their size.
    pub scale: u32,
    pub margin: f32,
    /// Fraction of the marker to line vector where a name is centred.
    pub text_position: f32,
    pub title_align: TitleAlign,
    pub title_font: Option<PathBuf>,
    pub name_font: Option<PathBuf>,
    /// Sizes in pixels of the scaled canvas.
    pub title_size: f32,
    pub name_size: f32,
    pub jpeg_quality: u8,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            scale: 2,
            margin: 25.0,
            text_position: 0.85,
            title_align: TitleAlign::Left,
            title_font: None,
            name_font: None,
            title_size: 48.0,
            name_size: 20.0,
            jpeg_quality: 95,
        }
    }
}

/// Resolved fonts and settings, built once per batch and shared by every render.
pub struct RenderContext {
    pub title: SizedFont,
    pub names: SizedFont,
    pub config: RenderConfig,
}

impl RenderContext {
    pub fn new(config: &RenderConfig) -> anyhow::Result<Self> {
        Ok(Self {
            title: SizedFont::new(load_face(config.title_font.as_deref(), true)?, config.title_size),
            names: SizedFont::new(load_face(config.name_font.as_deref(), false)?, config.name_size),
            config: config.clone(),
        })
    }
}

const INK: Rgb<u8> = Rgb([0, 0, 0]);

pub struct BracketRenderer<'a> {
    ctx: &'a RenderContext,
}

impl<'a> BracketRenderer<'a> {
    pub fn new(ctx: &'a RenderContext) -> Self {
        Self { ctx }
    }

    fn scale(&self) -> u32 {
        self.ctx.config.scale.max(1)
    }

    /// Writes the title and every bound name onto a copy of `template`.
    /// The result has the template's size.
    pub fn render(&self, template: &DynamicImage, bindings: &[Binding], title: Option<&str>) -> RgbImage {
        let base = template.to_rgb8();
        let (w, h) = base.dimensions();
        let s = self.scale();
        let mut canvas = if s > 1 {
            imageops::resize(&base, w * s, h * s, FilterType::Lanczos3)
        } else {
            base
        };
        if let Some(title) = title.filter(|t| !t.is_empty()) {
            self.draw_title(&mut canvas, title);
        }
        for binding in bindings {
            self.draw_name(&mut canvas, binding);
        }
        if s > 1 {
            imageops::resize(&canvas, w, h, FilterType::Lanczos3)
        } else {
            canvas
        }
    }

    fn draw_title(&self, canvas: &mut RgbImage, title: &str) {
        let cfg = &self.ctx.config;
        let s = self.scale() as f32;
        let (tw, th) = self.ctx.title.measure(title);
        let y = cfg.margin * 1.5 * s;
        match cfg.title_align {
            TitleAlign::Center => {
                let x = (canvas.width() as i32 - tw as i32) / 2;
                self.ctx.title.draw(canvas, x, y as i32, title, INK);
            }
            TitleAlign::Left => {
                let x = cfg.margin * 2.0 * s;
                self.ctx.title.draw(canvas, x as i32, y as i32, title, INK);
                let underline_y = (y + th as f32 + cfg.margin * 0.75 * s) as i32;
                let x_end = (x + tw as f32 + cfg.margin * s) as i32;
                for dy in 0..s as i32 {
                    for ux in (x as i32)..x_end {
                        if ux >= 0 && (ux as u32) < canvas.width() && underline_y + dy >= 0 && ((underline_y + dy) as u32) < canvas.height() {
                            canvas.put_pixel(ux as u32, (underline_y + dy) as u32, INK);
                        }
                    }
                }
            }
        }
    }

    fn draw_name(&self, canvas: &mut RgbImage, binding: &Binding) {
        let cfg = &self.ctx.config;
        let s = self.scale() as f32;
        let name = binding.participant.display_name();
        let (tw, th) = self.ctx.names.measure(&name);
        let (cx, lx, ly) = (
            binding.slot.marker.x as f32 * s,
            binding.slot.anchor.x as f32 * s,
            binding.slot.anchor.y as f32 * s,
        );
        let length = lx - cx;
        let tx = cx + length * cfg.text_position - tw as f32 / 2.0;
        let ty = ly - vertical_offset(length, th as f32, cfg.margin * s);
        self.ctx.names.draw(canvas, tx.round() as i32, ty.round() as i32, &name, INK);
    }
}

/// Lift of a name above its line: grows with the line length, kept between
/// 0.4 and 0.6 margins above the text height.
pub fn vertical_offset(length: f32, text_height: f32, margin: f32) -> f32 {
    let low = text_height + margin * 0.4;
    let high = text_height + margin * 0.6;
    (length * 0.04).max(low).min(high)
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> anyhow::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(Cursor::new(&mut buffer), quality.clamp(1, 100)).encode_image(img)?;
    Ok(buffer)
}
