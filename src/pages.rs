use std::path::{Path, PathBuf};
use anyhow::Context;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use log::info;
use pdf_writer::{Content, Filter, Name, Pdf, Rect, Ref};
use crate::render::encode_jpeg;
use crate::util::write_file;

pub const DOCUMENT_FILE: &str = "brackets.pdf";

// A4 at 300 dpi
pub const PAGE_WIDTH: u32 = 2480;
pub const PAGE_HEIGHT: u32 = 3508;
const MARGIN: u32 = 50;
const SPACING: u32 = 50;
// A4 in PDF points
const PAGE_PT: (f32, f32) = (595.276, 841.89);
const PAGE_QUALITY: u8 = 90;

/// Size of `(w, h)` scaled to fit `(max_w, max_h)` keeping the aspect ratio.
pub fn fit(w: u32, h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if w == 0 || h == 0 {
        return (0, 0);
    }
    let scale = (max_w as f64 / w as f64).min(max_h as f64 / h as f64);
    (((w as f64 * scale) as u32).max(1), ((h as f64 * scale) as u32).max(1))
}

/// Two brackets per page, one in each half, centred there.
pub fn compose_page(top: &RgbImage, bottom: Option<&RgbImage>) -> RgbImage {
    let mut page = RgbImage::from_pixel(PAGE_WIDTH, PAGE_HEIGHT, Rgb([255, 255, 255]));
    let avail_w = PAGE_WIDTH - 2 * MARGIN;
    let avail_h = (PAGE_HEIGHT - 2 * MARGIN - SPACING) / 2;
    let halves = [Some(top), bottom];
    for (ix, img) in halves.into_iter().enumerate() {
        let Some(img) = img else {
            continue;
        };
        let (w, h) = fit(img.width(), img.height(), avail_w, avail_h);
        if w == 0 {
            continue;
        }
        let scaled = imageops::resize(img, w, h, FilterType::Lanczos3);
        let half_top = MARGIN + ix as u32 * (avail_h + SPACING);
        let x = MARGIN + (avail_w - w) / 2;
        let y = half_top + (avail_h - h) / 2;
        imageops::replace(&mut page, &scaled, x as i64, y as i64);
    }
    page
}

/// Builds a PDF with one A4 page per raster page, each drawn over the full page.
pub fn pdf_document(pages: &[RgbImage]) -> anyhow::Result<Vec<u8>> {
    let mut pdf = Pdf::new();
    let catalog_id = Ref::new(1);
    let tree_id = Ref::new(2);
    // page, content and image objects of page n follow the tree
    let ids = |n: usize| {
        let base = 3 + 3 * n as i32;
        (Ref::new(base), Ref::new(base + 1), Ref::new(base + 2))
    };
    pdf.catalog(catalog_id).pages(tree_id);
    pdf.pages(tree_id)
        .kids((0..pages.len()).map(|n| ids(n).0))
        .count(pages.len() as i32);
    let image_name = Name(b"Bracket");
    for (n, page) in pages.iter().enumerate() {
        let (page_id, content_id, image_id) = ids(n);
        let jpeg = encode_jpeg(page, PAGE_QUALITY)?;
        {
            let mut image = pdf.image_xobject(image_id, &jpeg);
            image.filter(Filter::DctDecode);
            image.width(page.width() as i32);
            image.height(page.height() as i32);
            image.color_space().device_rgb();
            image.bits_per_component(8);
        }
        {
            let mut pdf_page = pdf.page(page_id);
            pdf_page.media_box(Rect::new(0.0, 0.0, PAGE_PT.0, PAGE_PT.1));
            pdf_page.parent(tree_id);
            pdf_page.contents(content_id);
            pdf_page.resources().x_objects().pair(image_name, image_id);
        }
        let mut content = Content::new();
        content.save_state();
        content.transform([PAGE_PT.0, 0.0, 0.0, PAGE_PT.1, 0.0, 0.0]);
        content.x_object(image_name);
        content.restore_state();
        pdf.stream(content_id, &content.finish());
    }
    Ok(pdf.finish())
}

/// Stacks the rendered brackets two per page into `brackets.pdf` and returns
/// the page count. Nothing is written without brackets.
pub fn write_document(out_dir: &Path, brackets: &[PathBuf]) -> anyhow::Result<usize> {
    if brackets.is_empty() {
        return Ok(0);
    }
    let pages = brackets.chunks(2)
        .map(|pair| {
            let load = |p: &PathBuf| image::open(p)
                .map(|i| i.to_rgb8())
                .with_context(|| format!("Cannot open bracket {}", p.to_string_lossy()));
            let top = load(&pair[0])?;
            let bottom = pair.get(1).map(load).transpose()?;
            Ok(compose_page(&top, bottom.as_ref()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    write_file(&out_dir.join(DOCUMENT_FILE), &pdf_document(&pages)?)?;
    info!("Wrote {DOCUMENT_FILE}, {} pages for {} brackets", pages.len(), brackets.len());
    Ok(pages.len())
}
