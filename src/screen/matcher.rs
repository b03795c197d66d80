//! Template matching against captured frames.
//!
//! Scores are the normalised correlation coefficient between the template and
//! each same-sized window of the frame, on 8-bit luma. All sums are exact
//! integers, so two windows with identical pixels always score identically and
//! the raster-order tie-break (top-to-bottom, then left-to-right) is exact.
//!
//! Searches too large to scan exhaustively go through an image pyramid: every
//! window of the coarsest level is scored, and the best few positions are
//! refined down to full resolution. Only refined windows are compared there, so
//! on a large search the result is the best refined window.

use image::{GrayImage, RgbImage};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::types::{MatchResult, Region};
use crate::error::{StepError, StepResult};

/// Default acceptance threshold for a match
pub const DEFAULT_CONFIDENCE: f64 = 0.9;

/// A decoded template ready for matching
#[derive(Debug, Clone)]
pub struct Template {
    luma: GrayImage,
    sum: u64,
    sum_sq: u64,
    source: Option<PathBuf>,
}

impl Template {
    /// Decode an image reference. Decoding failures are reference load errors.
    pub fn load(path: &Path) -> StepResult<Self> {
        let image = image::open(path).map_err(|e| StepError::ReferenceLoadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut template = Self::from_luma(image.to_luma8());
        template.source = Some(path.to_path_buf());
        Ok(template)
    }

    pub fn from_rgb(image: &RgbImage) -> Self {
        Self::from_luma(rgb_to_luma(image))
    }

    pub fn from_luma(luma: GrayImage) -> Self {
        let (sum, sum_sq) = luma.as_raw().iter().fold((0u64, 0u64), |(s, sq), &p| {
            let p = u64::from(p);
            (s + p, sq + p * p)
        });
        Self {
            luma,
            sum,
            sum_sq,
            source: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.luma.width()
    }

    pub fn height(&self) -> u32 {
        self.luma.height()
    }

    /// File the template was decoded from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

/// Locate `template` in `frame`, accepting the best match only if it scores at least `threshold`.
///
/// `region` restricts the search (clipped to the frame). Fails with `MatchNotFound`,
/// carrying the best sub-threshold score when one was computed.
pub fn locate(
    template: &Template,
    frame: &RgbImage,
    region: Option<Region>,
    threshold: f64,
) -> StepResult<MatchResult> {
    let threshold = threshold.clamp(0.0, 1.0);
    match best_match(template, frame, region) {
        Some(found) if found.confidence >= threshold => {
            debug!(
                x = found.region.x,
                y = found.region.y,
                confidence = found.confidence,
                "template matched"
            );
            Ok(found)
        }
        Some(found) => Err(StepError::MatchNotFound {
            threshold,
            best: Some(found.confidence),
        }),
        None => Err(StepError::MatchNotFound {
            threshold,
            best: None,
        }),
    }
}

/// Exhaustive-scan work (windows times template pixels) above which the search goes coarse-to-fine
const EXHAUSTIVE_WORK_LIMIT: u64 = 2_000_000;

/// Smallest template side allowed at the coarsest pyramid level
const PYRAMID_MIN_SIDE: u32 = 4;

/// Coarse-level positions carried down to full resolution
const PYRAMID_SEEDS: usize = 16;

/// Search radius around a projected position at each finer level
const REFINE_RADIUS: u32 = 2;

/// Highest-scoring window of `frame` for `template`, or `None` if the template does not fit.
///
/// Small searches score every window. Larger ones score every window of a
/// downscaled pyramid level, then refine the best few positions level by level
/// with exact full-resolution scores.
pub fn best_match(template: &Template, frame: &RgbImage, region: Option<Region>) -> Option<MatchResult> {
    let area = match region {
        Some(r) => r.clip_to(frame.width(), frame.height())?,
        None => Region::new(0, 0, frame.width(), frame.height()),
    };
    let (tw, th) = (template.width(), template.height());
    if tw == 0 || th == 0 || tw > area.width || th > area.height {
        return None;
    }

    let search = crop_luma(frame, area);
    let depth = pyramid_depth(tw, th, area.width, area.height);
    let best = if depth == 0 {
        Scorer::new(template, &search).scan()
    } else {
        debug!(depth, "coarse-to-fine template search");
        coarse_to_fine(template, &search, depth)
    };

    best.map(|found| {
        let matched = Region::new(area.x + found.x, area.y + found.y, tw, th);
        MatchResult {
            region: matched,
            confidence: found.score,
            center: matched.center(),
        }
    })
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f64,
    x: u32,
    y: u32,
}

impl Candidate {
    /// Higher score wins; equal scores go to the earlier window in raster order
    fn beats(&self, other: &Candidate) -> bool {
        self.score > other.score || (self.score == other.score && (self.y, self.x) < (other.y, other.x))
    }
}

/// Exact scores of one template against one search image
struct Scorer<'a> {
    template: &'a Template,
    search: &'a GrayImage,
    integral: Integral,
    n: i128,
    t_sum: i128,
    t_var: i128,
}

impl<'a> Scorer<'a> {
    fn new(template: &'a Template, search: &'a GrayImage) -> Self {
        let n = i128::from(template.width()) * i128::from(template.height());
        let t_sum = i128::from(template.sum);
        Self {
            template,
            search,
            integral: Integral::new(search),
            n,
            t_sum,
            t_var: n * i128::from(template.sum_sq) - t_sum * t_sum,
        }
    }

    fn max_x(&self) -> u32 {
        self.search.width() - self.template.width()
    }

    fn max_y(&self) -> u32 {
        self.search.height() - self.template.height()
    }

    fn score(&self, x: u32, y: u32) -> f64 {
        let (tw, th) = (self.template.width(), self.template.height());
        let (w_sum, w_sum_sq) = self.integral.window(x, y, tw, th);
        let w_sum = i128::from(w_sum);
        let w_var = self.n * i128::from(w_sum_sq) - w_sum * w_sum;

        let score = if self.t_var == 0 || w_var == 0 {
            if self.t_var == 0 && w_var == 0 {
                let diff = (self.t_sum - w_sum).abs() as f64 / self.n as f64;
                1.0 - diff / 255.0
            } else {
                0.0
            }
        } else {
            let cross = i128::from(cross_sum(&self.template.luma, self.search, x, y));
            let numerator = self.n * cross - self.t_sum * w_sum;
            numerator as f64 / ((self.t_var as f64).sqrt() * (w_var as f64).sqrt())
        };
        score.clamp(0.0, 1.0)
    }

    /// Best window with its origin inside the given inclusive bounds
    fn best_in(&self, x0: u32, x1: u32, y0: u32, y1: u32) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;
        for y in y0..=y1 {
            for x in x0..=x1 {
                // Strictly greater keeps the first window in raster order on ties.
                let score = self.score(x, y);
                if best.is_none_or(|b| score > b.score) {
                    best = Some(Candidate { score, x, y });
                }
            }
        }
        best
    }

    fn scan(&self) -> Option<Candidate> {
        self.best_in(0, self.max_x(), 0, self.max_y())
    }

    /// Best window within `REFINE_RADIUS` of `(cx, cy)`
    fn best_near(&self, cx: u32, cy: u32) -> Option<Candidate> {
        let (max_x, max_y) = (self.max_x(), self.max_y());
        let x0 = cx.saturating_sub(REFINE_RADIUS).min(max_x);
        let y0 = cy.saturating_sub(REFINE_RADIUS).min(max_y);
        let x1 = cx.saturating_add(REFINE_RADIUS).min(max_x);
        let y1 = cy.saturating_add(REFINE_RADIUS).min(max_y);
        self.best_in(x0, x1, y0, y1)
    }
}

/// Number of halvings before an exhaustive scan is cheap enough
fn pyramid_depth(tw: u32, th: u32, sw: u32, sh: u32) -> usize {
    let (mut tw, mut th, mut sw, mut sh) = (tw, th, sw, sh);
    let mut depth = 0;
    while scan_work(tw, th, sw, sh) > EXHAUSTIVE_WORK_LIMIT && tw.min(th) / 2 >= PYRAMID_MIN_SIDE {
        (tw, th, sw, sh) = (tw / 2, th / 2, sw / 2, sh / 2);
        depth += 1;
    }
    depth
}

fn scan_work(tw: u32, th: u32, sw: u32, sh: u32) -> u64 {
    u64::from(sw - tw + 1) * u64::from(sh - th + 1) * u64::from(tw) * u64::from(th)
}

fn coarse_to_fine(template: &Template, search: &GrayImage, depth: usize) -> Option<Candidate> {
    let mut levels: Vec<(Template, GrayImage)> = Vec::with_capacity(depth);
    for _ in 0..depth {
        let (t, s) = match levels.last() {
            Some((t, s)) => (&t.luma, s),
            None => (&template.luma, search),
        };
        let next = (Template::from_luma(half(t)), half(s));
        levels.push(next);
    }
    let mut scorers = vec![Scorer::new(template, search)];
    scorers.extend(levels.iter().map(|(t, s)| Scorer::new(t, s)));

    let coarse = &scorers[depth];
    let mut ranked = Vec::new();
    for y in 0..=coarse.max_y() {
        for x in 0..=coarse.max_x() {
            ranked.push(Candidate {
                score: coarse.score(x, y),
                x,
                y,
            });
        }
    }
    // Stable sort: equal scores stay in raster order.
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut seeds: Vec<Candidate> = Vec::with_capacity(PYRAMID_SEEDS);
    for candidate in ranked {
        if seeds.len() == PYRAMID_SEEDS {
            break;
        }
        let distinct = seeds.iter().all(|s| {
            s.x.abs_diff(candidate.x) > REFINE_RADIUS || s.y.abs_diff(candidate.y) > REFINE_RADIUS
        });
        if distinct {
            seeds.push(candidate);
        }
    }

    seeds
        .into_iter()
        .filter_map(|seed| {
            scorers[..depth]
                .iter()
                .rev()
                .try_fold(seed, |at, scorer| scorer.best_near(at.x * 2, at.y * 2))
        })
        .fold(None, |best: Option<Candidate>, found| match best {
            Some(b) if !found.beats(&b) => Some(b),
            _ => Some(found),
        })
}

/// 2x2 box-filtered half-size copy
fn half(image: &GrayImage) -> GrayImage {
    GrayImage::from_fn(image.width() / 2, image.height() / 2, |x, y| {
        let sum: u32 = [(0, 0), (1, 0), (0, 1), (1, 1)]
            .iter()
            .map(|&(dx, dy)| u32::from(image.get_pixel(2 * x + dx, 2 * y + dy)[0]))
            .sum();
        image::Luma([((sum + 2) / 4) as u8])
    })
}

/// Summed-area tables of pixel values and squared values
struct Integral {
    stride: usize,
    sum: Vec<u64>,
    sum_sq: Vec<u64>,
}

impl Integral {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sum_sq = vec![0u64; stride * (h + 1)];
        let raw = image.as_raw();
        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = u64::from(raw[y * w + x]);
                row += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row;
                sum_sq[idx] = sum_sq[idx - stride] + row_sq;
            }
        }
        Self {
            stride,
            sum,
            sum_sq,
        }
    }

    fn window(&self, x: u32, y: u32, w: u32, h: u32) -> (u64, u64) {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        let at = |table: &[u64], x: usize, y: usize| table[y * self.stride + x];
        let rect = |table: &[u64]| {
            at(table, x1, y1) + at(table, x0, y0) - at(table, x0, y1) - at(table, x1, y0)
        };
        (rect(&self.sum), rect(&self.sum_sq))
    }
}

fn cross_sum(template: &GrayImage, search: &GrayImage, x: u32, y: u32) -> u64 {
    let tw = template.width() as usize;
    let sw = search.width() as usize;
    let t_raw = template.as_raw();
    let s_raw = search.as_raw();
    let mut acc = 0u64;
    for (ty, t_row) in t_raw.chunks_exact(tw).enumerate() {
        let start = (y as usize + ty) * sw + x as usize;
        let s_row = &s_raw[start..start + tw];
        acc += t_row
            .iter()
            .zip(s_row)
            .map(|(&a, &b)| u64::from(a) * u64::from(b))
            .sum::<u64>();
    }
    acc
}

fn rgb_to_luma(image: &RgbImage) -> GrayImage {
    image::DynamicImage::ImageRgb8(image.clone()).to_luma8()
}

fn crop_luma(frame: &RgbImage, area: Region) -> GrayImage {
    let view = image::imageops::crop_imm(frame, area.x, area.y, area.width, area.height).to_image();
    rgb_to_luma(&view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::backend::MockFramebuffer;

    fn scene() -> MockFramebuffer {
        let mut fb = MockFramebuffer::with_color(120, 80, [30, 30, 30]);
        fb.draw_rect(70, 40, 20, 12, [220, 220, 220]);
        fb.draw_text(72, 42, "OK", [0, 0, 0], [220, 220, 220]);
        fb
    }

    #[test]
    fn test_locates_exact_patch() {
        let fb = scene();
        let template = Template::from_rgb(&fb.crop(70, 40, 20, 12).to_image());

        let found = locate(&template, &fb.to_image(), None, 0.9).unwrap();
        assert_eq!(found.region, Region::new(70, 40, 20, 12));
        assert_eq!(found.center, crate::screen::Point::new(80, 46));
        assert!(found.confidence > 0.999);
    }

    /// Screen tiled with 16x16 cells of pseudo-random colours
    fn tiled(width: u32, height: u32) -> MockFramebuffer {
        let mut fb = MockFramebuffer::new(width, height);
        for cy in 0..height.div_ceil(16) {
            for cx in 0..width.div_ceil(16) {
                let h = cx.wrapping_mul(73_856_093) ^ cy.wrapping_mul(19_349_663);
                fb.draw_rect(cx * 16, cy * 16, 16, 16, [h as u8, (h >> 8) as u8, (h >> 16) as u8]);
            }
        }
        fb
    }

    #[test]
    fn test_large_search_finds_unaligned_patch() {
        let fb = tiled(640, 480);
        let template = Template::from_rgb(&fb.crop(137, 211, 60, 30).to_image());
        assert!(pyramid_depth(60, 30, 640, 480) > 0);

        let found = locate(&template, &fb.to_image(), None, 0.99).unwrap();
        assert_eq!(found.region, Region::new(137, 211, 60, 30));
        assert!(found.confidence > 0.999);
    }

    #[test]
    fn test_small_searches_scan_every_window() {
        assert_eq!(pyramid_depth(20, 12, 120, 80), 0);
        assert_eq!(pyramid_depth(6, 6, 60, 60), 0);
        assert!(pyramid_depth(100, 40, 1920, 1080) >= 2);
    }

    #[test]
    fn test_template_larger_than_frame() {
        let fb = MockFramebuffer::new(10, 10);
        let template = Template::from_rgb(&MockFramebuffer::new(11, 4).to_image());

        let err = locate(&template, &fb.to_image(), None, 0.5).unwrap_err();
        assert_eq!(err, StepError::MatchNotFound { threshold: 0.5, best: None });
    }

    #[test]
    fn test_template_larger_than_region() {
        let fb = scene();
        let template = Template::from_rgb(&fb.crop(70, 40, 20, 12).to_image());
        let region = Some(Region::new(0, 0, 15, 15));
        assert!(best_match(&template, &fb.to_image(), region).is_none());
    }

    #[test]
    fn test_region_restricts_search_and_reports_frame_coordinates() {
        let mut fb = MockFramebuffer::with_color(100, 40, [0, 0, 0]);
        let mut patch = MockFramebuffer::with_color(8, 8, [0, 0, 0]);
        patch.draw_rect(2, 2, 4, 4, [255, 255, 255]);
        for px in [10u32, 60] {
            fb.draw_rect(px + 2, 10 + 2, 4, 4, [255, 255, 255]);
        }
        let template = Template::from_rgb(&patch.to_image());

        let anywhere = locate(&template, &fb.to_image(), None, 0.9).unwrap();
        assert_eq!(anywhere.region.x, 10);

        let right_half = locate(&template, &fb.to_image(), Some(Region::new(50, 0, 50, 40)), 0.9).unwrap();
        assert_eq!(right_half.region, Region::new(60, 10, 8, 8));
    }

    #[test]
    fn test_ties_resolve_in_raster_order() {
        let mut fb = MockFramebuffer::with_color(60, 60, [0, 0, 0]);
        // Same patch three times: lower-left, upper-right, upper-left-ish on a later column
        for (x, y) in [(5u32, 40u32), (40, 5), (20, 5)] {
            fb.draw_rect(x, y, 6, 6, [200, 50, 50]);
            fb.draw_rect(x + 1, y + 1, 2, 2, [10, 240, 10]);
        }
        let template = Template::from_rgb(&fb.crop(40, 5, 6, 6).to_image());

        let found = locate(&template, &fb.to_image(), None, 0.99).unwrap();
        assert_eq!((found.region.x, found.region.y), (20, 5));
    }

    #[test]
    fn test_threshold_monotonicity() {
        let mut fb = scene();
        let template = Template::from_rgb(&fb.crop(70, 40, 20, 12).to_image());
        // Perturb the on-screen copy so the best score drops below 1.0
        fb.draw_rect(70, 40, 3, 3, [90, 90, 90]);
        let frame = fb.to_image();

        let score = best_match(&template, &frame, None).unwrap().confidence;
        assert!(score < 1.0 && score > 0.5, "score was {}", score);

        assert!(locate(&template, &frame, None, score).is_ok());
        for lower in [score - 0.01, score / 2.0, 0.0] {
            assert!(locate(&template, &frame, None, lower).is_ok());
        }
        let err = locate(&template, &frame, None, (score + 0.01).min(1.0)).unwrap_err();
        assert_eq!(err.best_confidence(), Some(score));
    }

    #[test]
    fn test_flat_template_matches_flat_area() {
        let mut fb = MockFramebuffer::with_color(30, 30, [0, 0, 0]);
        fb.draw_rect(10, 10, 10, 10, [128, 128, 128]);
        let template = Template::from_rgb(&MockFramebuffer::with_color(5, 5, [128, 128, 128]).to_image());

        let found = locate(&template, &fb.to_image(), None, 0.99).unwrap();
        assert_eq!((found.region.x, found.region.y), (10, 10));
        assert_eq!(found.confidence, 1.0);
    }

    #[test]
    fn test_load_rejects_undecodable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();

        let err = Template::load(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ReferenceLoadError);
    }

    #[test]
    fn test_load_decodes_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("button.png");
        scene().crop(70, 40, 20, 12).save_png(&path).unwrap();

        let template = Template::load(&path).unwrap();
        assert_eq!((template.width(), template.height()), (20, 12));
        assert_eq!(template.source(), Some(path.as_path()));
    }
}
