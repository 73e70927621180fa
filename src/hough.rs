use std::f64::consts::PI;
use image::GrayImage;
use rand::Rng;
use crate::detect::{Point, Segment};

const SHIFT: u32 = 16;

#[derive(Clone, Copy, Debug)]
pub struct HoughParams {
    /// Distance resolution of the accumulator in pixels.
    pub rho: f64,
    /// Angle resolution of the accumulator in radians.
    pub theta: f64,
    pub threshold: u32,
    pub min_line_length: u32,
    pub max_line_gap: u32,
}

impl Default for HoughParams {
    fn default() -> Self {
        Self {
            rho: 1.0,
            theta: PI / 180.0,
            threshold: 30,
            min_line_length: 20,
            max_line_gap: 5,
        }
    }
}

struct Accumulator {
    votes: Vec<i32>,
    num_rho: usize,
    trig: Vec<(f64, f64)>,
}

impl Accumulator {
    fn new(width: u32, height: u32, params: &HoughParams) -> Self {
        let num_angle = (PI / params.theta).round().max(1.0) as usize;
        let num_rho = ((((width + height) * 2 + 1) as f64) / params.rho).round().max(1.0) as usize;
        let irho = 1.0 / params.rho;
        let trig = (0..num_angle)
            .map(|n| {
                let angle = n as f64 * params.theta;
                (angle.cos() * irho, angle.sin() * irho)
            })
            .collect();
        Self { votes: vec![0; num_angle * num_rho], num_rho, trig }
    }

    fn bin(&self, n: usize, x: i64, y: i64) -> usize {
        let (cos, sin) = self.trig[n];
        let r = (x as f64 * cos + y as f64 * sin).round() as i64 + (self.num_rho as i64 - 1) / 2;
        n * self.num_rho + r.clamp(0, self.num_rho as i64 - 1) as usize
    }

    /// Adds the point's votes, returns the strongest angle and its count.
    fn vote(&mut self, x: i64, y: i64) -> (usize, i32) {
        let mut best = (0, 0);
        for n in 0..self.trig.len() {
            let bin = self.bin(n, x, y);
            self.votes[bin] += 1;
            if self.votes[bin] > best.1 {
                best = (n, self.votes[bin]);
            }
        }
        best
    }

    fn unvote(&mut self, x: i64, y: i64) {
        for n in 0..self.trig.len() {
            let bin = self.bin(n, x, y);
            self.votes[bin] -= 1;
        }
    }
}

// Fixed point walk along a line direction, one pixel per step along the major axis.
#[derive(Clone, Copy)]
struct Walk {
    x0: i64,
    y0: i64,
    dx: i64,
    dy: i64,
    x_major: bool,
}

impl Walk {
    fn new(x: i64, y: i64, a: f64, b: f64) -> Self {
        let half = 1i64 << (SHIFT - 1);
        if a.abs() > b.abs() {
            Self {
                x0: x,
                y0: (y << SHIFT) + half,
                dx: if a > 0.0 { 1 } else { -1 },
                dy: (b * (1i64 << SHIFT) as f64 / a.abs()).round() as i64,
                x_major: true,
            }
        } else {
            Self {
                x0: (x << SHIFT) + half,
                y0: y,
                dx: (a * (1i64 << SHIFT) as f64 / b.abs()).round() as i64,
                dy: if b > 0.0 { 1 } else { -1 },
                x_major: false,
            }
        }
    }

    fn pixel(&self, x: i64, y: i64) -> (i64, i64) {
        if self.x_major { (x, y >> SHIFT) } else { (x >> SHIFT, y) }
    }

    fn step(&self, forward: bool) -> (i64, i64) {
        if forward { (self.dx, self.dy) } else { (-self.dx, -self.dy) }
    }
}

/// Progressive probabilistic Hough transform over the set pixels of `edges`.
/// Points are visited in a random order drawn from `rng`; a fixed seed makes the
/// result reproducible. Accepted segments give their votes back so one stroke
/// is reported once.
pub fn probabilistic_hough<R: Rng>(edges: &GrayImage, params: &HoughParams, rng: &mut R) -> Vec<Segment> {
    let (width, height) = edges.dimensions();
    let (w, h) = (width as i64, height as i64);
    let mut mask = edges.pixels().map(|p| p.0[0] > 0).collect::<Vec<_>>();
    let mut points = mask.iter()
        .enumerate()
        .filter(|(_, set)| **set)
        .map(|(ix, _)| ((ix as i64) % w, (ix as i64) / w))
        .collect::<Vec<_>>();
    let mut acc = Accumulator::new(width, height, params);
    let threshold = params.threshold as i32;
    let min_len = params.min_line_length as i64;
    let max_gap = params.max_line_gap as i64;
    let at = |x: i64, y: i64| (y * w + x) as usize;
    let mut segments = Vec::new();

    while !points.is_empty() {
        let ix = rng.random_range(0..points.len());
        let (x, y) = points.swap_remove(ix);
        // already consumed by an earlier walk
        if !mask[at(x, y)] {
            continue;
        }
        let (n, count) = acc.vote(x, y);
        if count < threshold {
            continue;
        }
        let (cos, sin) = acc.trig[n];
        let walk = Walk::new(x, y, -sin, cos);

        let mut ends = [(x, y); 2];
        for (k, end) in ends.iter_mut().enumerate() {
            let (dx, dy) = walk.step(k == 0);
            let (mut cx, mut cy) = (walk.x0, walk.y0);
            let mut gap = 0;
            loop {
                let (px, py) = walk.pixel(cx, cy);
                if px < 0 || px >= w || py < 0 || py >= h {
                    break;
                }
                if mask[at(px, py)] {
                    gap = 0;
                    *end = (px, py);
                } else {
                    gap += 1;
                    if gap > max_gap {
                        break;
                    }
                }
                cx += dx;
                cy += dy;
            }
        }

        let good = (ends[1].0 - ends[0].0).abs() >= min_len || (ends[1].1 - ends[0].1).abs() >= min_len;

        for (k, end) in ends.iter().enumerate() {
            let (dx, dy) = walk.step(k == 0);
            let (mut cx, mut cy) = (walk.x0, walk.y0);
            loop {
                let (px, py) = walk.pixel(cx, cy);
                if px < 0 || px >= w || py < 0 || py >= h {
                    break;
                }
                let pix = at(px, py);
                if mask[pix] {
                    if good {
                        acc.unvote(px, py);
                    }
                    mask[pix] = false;
                }
                if (px, py) == *end {
                    break;
                }
                cx += dx;
                cy += dy;
            }
        }

        if good {
            segments.push(Segment::new(
                Point::new(ends[0].0 as i32, ends[0].1 as i32),
                Point::new(ends[1].0 as i32, ends[1].1 as i32),
            ));
        }
    }
    segments
}
