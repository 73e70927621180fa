use std::collections::VecDeque;
use std::f64::consts::PI;
use image::{DynamicImage, GrayImage, Luma, RgbImage};
use log::debug;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use crate::hough::{probabilistic_hough, HoughParams};

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
    pub fn dist2(&self, other: &Point) -> i64 {
        let dx = (self.x - other.x) as i64;
        let dy = (self.y - other.y) as i64;
        dx * dx + dy * dy
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Segment {
    pub start: Point,
    pub end: Point,
}

impl Segment {
    pub fn new(start: Point, end: Point) -> Self {
        Self { start, end }
    }
    pub fn dx(&self) -> i32 {
        self.end.x - self.start.x
    }
    pub fn dy(&self) -> i32 {
        self.end.y - self.start.y
    }
    pub fn mid(&self) -> Point {
        Point::new((self.start.x + self.end.x) / 2, (self.start.y + self.end.y) / 2)
    }
    /// Same segment with `start` on the left.
    pub fn left_to_right(self) -> Self {
        if self.end.x < self.start.x { Self::new(self.end, self.start) } else { self }
    }
}

/// Inclusive HSV box, hue in 0..=179 as in 8-bit OpenCV images.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HsvRange {
    pub name: String,
    pub low: [u8; 3],
    pub high: [u8; 3],
}

impl HsvRange {
    fn new(name: &str, low: [u8; 3], high: [u8; 3]) -> Self {
        Self { name: name.to_string(), low, high }
    }
    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        (0..3).all(|i| self.low[i] <= hsv[i] && hsv[i] <= self.high[i])
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LinePass {
    pub hough_threshold: u32,
    pub min_line_length: u32,
    pub max_line_gap: u32,
    /// Largest vertical drift of a segment still counted as horizontal.
    pub max_skew: u32,
}

impl Default for LinePass {
    fn default() -> Self {
        Self { hough_threshold: 30, min_line_length: 20, max_line_gap: 5, max_skew: 10 }
    }
}

impl LinePass {
    pub fn relaxed() -> Self {
        Self { hough_threshold: 20, min_line_length: 10, max_line_gap: 10, max_skew: 5 }
    }
    fn hough(&self) -> HoughParams {
        HoughParams {
            threshold: self.hough_threshold,
            min_line_length: self.min_line_length,
            max_line_gap: self.max_line_gap,
            ..HoughParams::default()
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DetectConfig {
    /// Gray levels at or below this are ink.
    pub binarize_threshold: u8,
    pub line_pass: LinePass,
    /// Retried when `line_pass` finds nothing.
    pub relaxed_line_pass: LinePass,
    /// Detections closer than this on both axes are one detection.
    pub merge_gap: u32,
    pub ink_ranges: Vec<HsvRange>,
    pub kernel_radius: u32,
    pub marker_min_area: f64,
    pub min_circularity: f64,
    pub fallback_min_area: f64,
    /// Seed of the Hough point sampling.
    pub seed: u64,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            binarize_threshold: 200,
            line_pass: LinePass::default(),
            relaxed_line_pass: LinePass::relaxed(),
            merge_gap: 10,
            ink_ranges: vec![
                HsvRange::new("red", [0, 50, 50], [10, 255, 255]),
                HsvRange::new("red-wrap", [160, 50, 50], [179, 255, 255]),
                HsvRange::new("blue", [90, 50, 50], [130, 255, 255]),
                HsvRange::new("black", [0, 0, 0], [180, 255, 50]),
            ],
            kernel_radius: 2,
            marker_min_area: 20.0,
            min_circularity: 0.5,
            fallback_min_area: 10.0,
            seed: 0x5eed,
        }
    }
}

/// What one template image offers for name placement.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct Detection {
    pub width: u32,
    pub height: u32,
    /// Slot markers, sorted by (y, x). This order is the slot order of the template.
    pub markers: Vec<Point>,
    /// Horizontal connector lines, left to right, sorted by midpoint (y, x).
    pub lines: Vec<Segment>,
    pub relaxed_lines: bool,
    pub fallback_markers: bool,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty() && self.lines.is_empty()
    }
}

pub struct SlotDetector {
    config: DetectConfig,
}

impl SlotDetector {
    pub fn new(config: DetectConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, image: &DynamicImage) -> Detection {
        let rgb = image.to_rgb8();
        let binary = binarize(&image.to_luma8(), self.config.binarize_threshold);

        let (mut lines, mut relaxed_lines) = (self.detect_lines(&binary, &self.config.line_pass), false);
        if lines.is_empty() {
            lines = self.detect_lines(&binary, &self.config.relaxed_line_pass);
            relaxed_lines = !lines.is_empty();
        }
        let (mut markers, mut fallback_markers) = (self.detect_markers(&rgb), false);
        if markers.is_empty() {
            markers = self.fallback_markers(&binary, &lines);
            fallback_markers = !markers.is_empty();
        }
        markers.sort_by_key(|p| (p.y, p.x));
        debug_assert!(markers.windows(2).all(|w| (w[0].y, w[0].x) <= (w[1].y, w[1].x)));
        debug!("Detected {} markers{} and {} lines{}",
            markers.len(), if fallback_markers { " (line ends)" } else { "" },
            lines.len(), if relaxed_lines { " (relaxed)" } else { "" });
        Detection {
            width: rgb.width(),
            height: rgb.height(),
            markers,
            lines,
            relaxed_lines,
            fallback_markers,
        }
    }

    fn detect_lines(&self, binary: &GrayImage, pass: &LinePass) -> Vec<Segment> {
        let edges = edge_map(binary);
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let horizontal = probabilistic_hough(&edges, &pass.hough(), &mut rng)
            .into_iter()
            .filter(|s| s.dy().unsigned_abs() <= pass.max_skew && s.dx().unsigned_abs() * 2 >= pass.min_line_length)
            .map(Segment::left_to_right)
            .collect::<Vec<_>>();
        let fused = fuse_collinear(horizontal, self.config.merge_gap as i32);
        let mut lines = merge_close(fused, self.config.merge_gap as i32);
        lines.sort_by_key(|s| (s.mid().y, s.mid().x));
        lines
    }

    fn detect_markers(&self, rgb: &RgbImage) -> Vec<Point> {
        let mut mask = GrayImage::new(rgb.width(), rgb.height());
        for (x, y, px) in rgb.enumerate_pixels() {
            let hsv = rgb_to_hsv(px.0);
            if self.config.ink_ranges.iter().any(|r| r.contains(hsv)) {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let kernel = disk_kernel(self.config.kernel_radius as i32);
        let mask = dilate(&erode(&mask, &kernel), &kernel);
        let mask = erode(&dilate(&mask, &kernel), &kernel);
        components(&mask)
            .into_iter()
            .filter_map(|c| {
                let contour = c.contour();
                let area = polygon_area(&contour);
                let perimeter = chain_length(&contour);
                if area < self.config.marker_min_area || perimeter == 0.0 {
                    return None;
                }
                let circularity = 4.0 * PI * area / (perimeter * perimeter);
                (circularity >= self.config.min_circularity).then(|| c.centroid())
            })
            .collect()
    }

    /// Slot indicators of a dotless template: the left ends of the first round
    /// lines, or the leftmost point of every ink blob when there are no lines.
    fn fallback_markers(&self, binary: &GrayImage, lines: &[Segment]) -> Vec<Point> {
        if !lines.is_empty() {
            return first_round(lines, self.config.merge_gap as i32)
                .iter()
                .map(|l| Point::new(l.start.x, l.mid().y))
                .collect();
        }
        components(binary)
            .into_iter()
            .filter(|c| polygon_area(&c.contour()) > self.config.fallback_min_area)
            .filter_map(|c| c.pixels.iter().copied().min_by_key(|p| (p.x, p.y)))
            .collect()
    }
}

/// Lines starting within `gap` of the leftmost line start, in (y, x) order.
/// On a bracket these are the entry lines, one per slot.
pub fn first_round(lines: &[Segment], gap: i32) -> Vec<Segment> {
    let Some(left) = lines.iter().map(|l| l.start.x).min() else {
        return Vec::new();
    };
    let mut entries = lines.iter()
        .filter(|l| l.start.x - left <= gap)
        .copied()
        .collect::<Vec<_>>();
    entries.sort_by_key(|s| (s.mid().y, s.mid().x));
    entries
}

fn binarize(gray: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        if gray.get_pixel(x, y).0[0] <= threshold { Luma([255]) } else { Luma([0]) }
    })
}

// Ink pixels touching background on one of their four sides.
fn edge_map(binary: &GrayImage) -> GrayImage {
    let (w, h) = binary.dimensions();
    let ink = |x: i64, y: i64| {
        x >= 0 && y >= 0 && x < w as i64 && y < h as i64 && binary.get_pixel(x as u32, y as u32).0[0] > 0
    };
    GrayImage::from_fn(w, h, |x, y| {
        let (x, y) = (x as i64, y as i64);
        let edge = ink(x, y) && !(ink(x - 1, y) && ink(x + 1, y) && ink(x, y - 1) && ink(x, y + 1));
        Luma([if edge { 255 } else { 0 }])
    })
}

// Pieces of one stroke (fragments, upper and lower outline) become one segment
// spanning their union.
fn fuse_collinear(mut segments: Vec<Segment>, gap: i32) -> Vec<Segment> {
    segments.sort_by_key(|s| (s.start.x, s.mid().y));
    struct Run {
        x0: i32,
        x1: i32,
        y_sum: i64,
        n: i64,
    }
    let mut runs: Vec<Run> = Vec::new();
    for s in segments {
        let y = s.mid().y;
        let found = runs.iter_mut().find(|r| {
            let ry = (r.y_sum / r.n) as i32;
            (ry - y).abs() <= gap && s.start.x <= r.x1 + gap && r.x0 <= s.end.x + gap
        });
        match found {
            Some(run) => {
                run.x0 = run.x0.min(s.start.x);
                run.x1 = run.x1.max(s.end.x);
                run.y_sum += y as i64;
                run.n += 1;
            }
            None => runs.push(Run { x0: s.start.x, x1: s.end.x, y_sum: y as i64, n: 1 }),
        }
    }
    runs.into_iter()
        .map(|r| {
            let y = (r.y_sum / r.n) as i32;
            Segment::new(Point::new(r.x0, y), Point::new(r.x1, y))
        })
        .collect()
}

fn merge_close(segments: Vec<Segment>, gap: i32) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::new();
    for s in segments {
        let m = s.mid();
        let close = merged.iter().any(|o| {
            let om = o.mid();
            (om.x - m.x).abs() < gap && (om.y - m.y).abs() < gap
        });
        if !close {
            merged.push(s);
        }
    }
    merged
}

/// 8-bit HSV with hue halved to fit 0..=179.
pub fn rgb_to_hsv([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (rf, gf, bf) = (r as f64, g as f64, b as f64);
    let v = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let diff = v - min;
    let s = if v == 0.0 { 0.0 } else { 255.0 * diff / v };
    let mut h = if diff == 0.0 {
        0.0
    } else if v == rf {
        60.0 * (gf - bf) / diff
    } else if v == gf {
        120.0 + 60.0 * (bf - rf) / diff
    } else {
        240.0 + 60.0 * (rf - gf) / diff
    };
    if h < 0.0 {
        h += 360.0;
    }
    [((h / 2.0).round() as u32 % 180) as u8, s.round() as u8, v as u8]
}

fn disk_kernel(radius: i32) -> Vec<(i32, i32)> {
    let mut offsets = Vec::new();
    for dy in -radius..=radius {
        let half = (((radius * radius - dy * dy) as f64).sqrt()).round() as i32;
        for dx in -half..=half {
            offsets.push((dx, dy));
        }
    }
    offsets
}

// Neighbours outside the image are ignored by both operators.
fn morph(mask: &GrayImage, kernel: &[(i32, i32)], all: bool) -> GrayImage {
    let (w, h) = mask.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        let mut inside = kernel.iter()
            .map(|(dx, dy)| (x as i32 + dx, y as i32 + dy))
            .filter(|(nx, ny)| *nx >= 0 && *ny >= 0 && *nx < w as i32 && *ny < h as i32)
            .map(|(nx, ny)| mask.get_pixel(nx as u32, ny as u32).0[0] > 0);
        let set = if all { inside.all(|v| v) } else { inside.any(|v| v) };
        Luma([if set { 255 } else { 0 }])
    })
}

fn erode(mask: &GrayImage, kernel: &[(i32, i32)]) -> GrayImage {
    morph(mask, kernel, true)
}

fn dilate(mask: &GrayImage, kernel: &[(i32, i32)]) -> GrayImage {
    morph(mask, kernel, false)
}

const DIRECTIONS: [(i32, i32); 8] = [(1, 0), (1, 1), (0, 1), (-1, 1), (-1, 0), (-1, -1), (0, -1), (1, -1)];

struct Component {
    label: u32,
    /// Raster order, so the first pixel is the top-left boundary pixel.
    pixels: Vec<Point>,
    labels: std::rc::Rc<LabelMap>,
}

struct LabelMap {
    width: i32,
    height: i32,
    labels: Vec<u32>,
}

impl LabelMap {
    fn get(&self, x: i32, y: i32) -> u32 {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return 0;
        }
        self.labels[(y * self.width + x) as usize]
    }
}

impl Component {
    fn centroid(&self) -> Point {
        let n = self.pixels.len().max(1) as f64;
        let (sx, sy) = self.pixels.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x as f64, sy + p.y as f64));
        Point::new((sx / n).round() as i32, (sy / n).round() as i32)
    }

    /// Outer boundary by Moore neighbour tracing, clockwise from the top-left pixel.
    fn contour(&self) -> Vec<Point> {
        let Some(&start) = self.pixels.first() else {
            return Vec::new();
        };
        let inside = |p: Point| self.labels.get(p.x, p.y) == self.label;
        let next = |p: Point, from: usize| -> Option<(usize, Point)> {
            (0..8).map(|i| (from + i) % 8).find_map(|d| {
                let q = Point::new(p.x + DIRECTIONS[d].0, p.y + DIRECTIONS[d].1);
                inside(q).then_some((d, q))
            })
        };
        let mut contour = vec![start];
        // west of the raster-first pixel is always background
        let Some((first_dir, mut current)) = next(start, 4) else {
            return contour;
        };
        let mut dir = first_dir;
        let limit = self.pixels.len() * 4 + 8;
        for _ in 0..limit {
            let back = (dir + 6 - (dir & 1)) % 8;
            let Some((d, q)) = next(current, back) else {
                break;
            };
            if current == start && d == first_dir {
                break;
            }
            contour.push(current);
            current = q;
            dir = d;
        }
        contour
    }
}

// 8-connected components of the set pixels, in raster order of their first pixel.
fn components(mask: &GrayImage) -> Vec<Component> {
    let (w, h) = (mask.width() as i32, mask.height() as i32);
    let mut labels = vec![0u32; (w * h) as usize];
    let mut groups: Vec<Vec<Point>> = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let ix = (y * w + x) as usize;
            if labels[ix] != 0 || mask.get_pixel(x as u32, y as u32).0[0] == 0 {
                continue;
            }
            let label = groups.len() as u32 + 1;
            labels[ix] = label;
            let mut pixels = Vec::new();
            let mut queue = VecDeque::from([Point::new(x, y)]);
            while let Some(p) = queue.pop_front() {
                pixels.push(p);
                for (dx, dy) in DIRECTIONS {
                    let (nx, ny) = (p.x + dx, p.y + dy);
                    if nx < 0 || ny < 0 || nx >= w || ny >= h {
                        continue;
                    }
                    let nix = (ny * w + nx) as usize;
                    if labels[nix] == 0 && mask.get_pixel(nx as u32, ny as u32).0[0] > 0 {
                        labels[nix] = label;
                        queue.push_back(Point::new(nx, ny));
                    }
                }
            }
            pixels.sort_by_key(|p| (p.y, p.x));
            groups.push(pixels);
        }
    }
    let labels = std::rc::Rc::new(LabelMap { width: w, height: h, labels });
    groups.into_iter()
        .enumerate()
        .map(|(ix, pixels)| Component { label: ix as u32 + 1, pixels, labels: labels.clone() })
        .collect()
}

fn polygon_area(points: &[Point]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice = points.iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64)
        .sum::<i64>();
    twice.abs() as f64 / 2.0
}

fn chain_length(points: &[Point]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    points.iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| ((a.dist2(b)) as f64).sqrt())
        .sum()
}
