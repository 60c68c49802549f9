//! Acquisition-activity segmentation of a session's file times.
//!
//! Files carry no explicit boundary markers, only modification times. The
//! clusterer estimates the density of those times with a Gaussian kernel,
//! picks the bandwidth that best predicts each file from the others
//! (leave-one-out log likelihood over a log-spaced grid), and cuts the
//! timeline at density valleys that are deep relative to the peaks on either
//! side.
//!
//! Boundaries are evaluated on a sampled curve: the density at every distinct
//! file time plus a fixed number of evenly spaced points inside every gap.

use std::f64::consts::PI;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::files::FileStamp;

/// Tuning knobs for [`cluster_files`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Candidate bandwidths between the smallest gap/4 and the full span.
    pub grid_points: usize,
    /// Samples placed inside each gap between consecutive distinct times.
    pub gap_samples: usize,
    /// A valley is a boundary when its density is below this fraction of the lower flanking peak.
    pub plateau_ratio: f64,
    /// A first or last file separated from the rest by more than this fraction of the
    /// session span is its own activity. With only two distinct times this is the sole rule.
    pub edge_outlier_fraction: f64,
    /// Kernels are ignored beyond this many bandwidths.
    pub kernel_cutoff: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            grid_points: 50,
            gap_samples: 16,
            plateau_ratio: 0.5,
            edge_outlier_fraction: 0.5,
            kernel_cutoff: 8.0,
        }
    }
}

/// Partition `files` into activities ordered by time.
///
/// Every input file lands in exactly one group; groups are contiguous in
/// (mtime, path) order and never overlap.
pub fn cluster_files(
    mut files: Vec<FileStamp>,
    session_span: Duration,
    cfg: &ClusterConfig,
) -> Vec<Vec<FileStamp>> {
    if files.is_empty() {
        return Vec::new();
    }
    files.sort_by(|a, b| (a.modified, &a.path).cmp(&(b.modified, &b.path)));
    let t0 = files[0].modified;
    let xs: Vec<f64> = files
        .iter()
        .map(|f| (f.modified - t0).num_milliseconds() as f64 / 1000.0)
        .collect();

    let boundaries = boundaries(&xs, seconds(session_span), cfg);
    if boundaries.is_empty() {
        return vec![files];
    }

    let mut groups: Vec<Vec<FileStamp>> = vec![Vec::new(); boundaries.len() + 1];
    for (file, x) in files.into_iter().zip(&xs) {
        let idx = boundaries.partition_point(|b| *b <= *x);
        groups[idx].push(file);
    }
    groups.retain(|g| !g.is_empty());
    groups
}

fn seconds(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

/// Boundary positions (seconds relative to the first file), ascending.
///
/// A file at or after a boundary starts a new activity. `xs` must be sorted.
/// Files sharing a time always stay together: the fit and the density work on
/// distinct times weighted by how many files carry each one.
pub fn boundaries(xs: &[f64], session_span_secs: f64, cfg: &ClusterConfig) -> Vec<f64> {
    let (pts, wts) = tally(xs);
    if pts.len() < 2 {
        return Vec::new();
    }
    let outlier = cfg.edge_outlier_fraction * session_span_secs;
    if pts.len() == 2 {
        return if pts[1] - pts[0] > outlier {
            vec![pts[1]]
        } else {
            Vec::new()
        };
    }

    let h = select_bandwidth(&pts, &wts, cfg);
    let (pos, dens) = sample_density(&pts, &wts, h, cfg);
    let mut cuts = valley_cuts(&pos, &dens, cfg.plateau_ratio);
    let m = pts.len();
    for (a, b) in [(pts[0], pts[1]), (pts[m - 2], pts[m - 1])] {
        if b - a > outlier && !cuts.iter().any(|c| *c > a && *c <= b) {
            cuts.push(b);
        }
    }
    cuts.sort_by(f64::total_cmp);
    debug!(
        files = xs.len(),
        distinct = m,
        bandwidth = h,
        boundaries = cuts.len(),
        "activity clustering"
    );
    cuts
}

/// Distinct values of sorted `xs` with their multiplicities.
fn tally(xs: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut pts: Vec<f64> = Vec::with_capacity(xs.len());
    let mut wts: Vec<f64> = Vec::with_capacity(xs.len());
    for &x in xs {
        if pts.last() == Some(&x) {
            if let Some(w) = wts.last_mut() {
                *w += 1.0;
            }
        } else {
            pts.push(x);
            wts.push(1.0);
        }
    }
    (pts, wts)
}

fn distinct(xs: &[f64]) -> Vec<f64> {
    tally(xs).0
}

/// Log-spaced candidate bandwidths from a quarter of the smallest positive gap to the span.
pub fn bandwidth_grid(xs: &[f64], points: usize) -> Vec<f64> {
    let d = distinct(xs);
    if d.len() < 2 {
        return Vec::new();
    }
    let span = d[d.len() - 1] - d[0];
    let min_gap = d
        .windows(2)
        .map(|w| w[1] - w[0])
        .fold(f64::INFINITY, f64::min);
    let lo = min_gap / 4.0;
    let hi = span;
    let points = points.max(2);
    if lo >= hi {
        return vec![hi];
    }
    let (llo, lhi) = (lo.ln(), hi.ln());
    (0..points)
        .map(|i| (llo + (lhi - llo) * i as f64 / (points - 1) as f64).exp())
        .collect()
}

fn kernel(u: f64, h: f64) -> f64 {
    (-0.5 * (u / h).powi(2)).exp() / (h * (2.0 * PI).sqrt())
}

/// Weighted kernel sum at `x` over distinct points `pts`, optionally leaving out one of them.
fn kernel_sum(pts: &[f64], wts: &[f64], x: f64, h: f64, cutoff: f64, skip: Option<usize>) -> f64 {
    let reach = cutoff * h;
    let lo = pts.partition_point(|v| *v < x - reach);
    let hi = pts.partition_point(|v| *v <= x + reach);
    (lo..hi)
        .filter(|j| Some(*j) != skip)
        .map(|j| wts[j] * kernel(x - pts[j], h))
        .sum()
}

/// Leave-one-out log likelihood under bandwidth `h`.
///
/// Every file is predicted from the files at other times, so a tie group is
/// left out as a whole and never scores its own zero-distance kernel.
pub fn loo_log_likelihood(pts: &[f64], wts: &[f64], h: f64, cutoff: f64) -> f64 {
    if pts.len() < 2 {
        return f64::NEG_INFINITY;
    }
    let n: f64 = wts.iter().sum();
    pts.iter()
        .zip(wts)
        .enumerate()
        .map(|(i, (&x, &w))| {
            let f = kernel_sum(pts, wts, x, h, cutoff, Some(i)) / (n - w);
            w * f.max(f64::MIN_POSITIVE).ln()
        })
        .sum()
}

/// Grid bandwidth with the highest leave-one-out likelihood; ties go to the wider one.
pub fn select_bandwidth(pts: &[f64], wts: &[f64], cfg: &ClusterConfig) -> f64 {
    let grid = bandwidth_grid(pts, cfg.grid_points);
    let mut best = (f64::NEG_INFINITY, grid.last().copied().unwrap_or(1.0));
    for h in grid {
        let ll = loo_log_likelihood(pts, wts, h, cfg.kernel_cutoff);
        if ll >= best.0 {
            best = (ll, h);
        }
    }
    best.1
}

/// Sample positions and densities: each distinct time plus `gap_samples` interior points per gap.
fn sample_density(pts: &[f64], wts: &[f64], h: f64, cfg: &ClusterConfig) -> (Vec<f64>, Vec<f64>) {
    let mut pos = Vec::with_capacity(pts.len() * (cfg.gap_samples + 1));
    for (i, &x) in pts.iter().enumerate() {
        pos.push(x);
        if let Some(&next) = pts.get(i + 1) {
            let step = (next - x) / (cfg.gap_samples + 1) as f64;
            pos.extend((1..=cfg.gap_samples).map(|k| x + step * k as f64));
        }
    }
    let norm: f64 = wts.iter().sum();
    let dens = pos
        .iter()
        .map(|&p| kernel_sum(pts, wts, p, h, cfg.kernel_cutoff, None) / norm)
        .collect();
    (pos, dens)
}

fn same(a: f64, b: f64) -> bool {
    a == b || (a - b).abs() <= 1e-12 * a.abs().max(b.abs())
}

/// Deep valleys of a sampled curve, located at the midpoint of each flat minimum run.
fn valley_cuts(pos: &[f64], dens: &[f64], plateau_ratio: f64) -> Vec<f64> {
    let m = dens.len();
    let mut cuts = Vec::new();
    let mut a = 1;
    while a + 1 < m {
        let mut b = a;
        while b + 1 < m && same(dens[b + 1], dens[a]) {
            b += 1;
        }
        let v = dens[a];
        let is_min = b + 1 < m && dens[a - 1] > v && !same(dens[a - 1], v) && dens[b + 1] > v;
        if is_min {
            let left = dens[..a]
                .iter()
                .rev()
                .take_while(|d| **d >= v)
                .fold(v, |acc, d| acc.max(*d));
            let right = dens[b + 1..]
                .iter()
                .take_while(|d| **d >= v)
                .fold(v, |acc, d| acc.max(*d));
            let base = left.min(right);
            if v < plateau_ratio * base {
                cuts.push((pos[a] + pos[b]) / 2.0);
            }
        }
        a = b + 1;
    }
    cuts
}
