//! Offline analysis of the CSV files written by the benchmarks.
//!
//! Everything here works on plain numbers so it can run on another machine
//! than the one that was measured.

use std::collections::BTreeMap;
use std::io::BufRead;

use itertools::Itertools;

use crate::error::BenchError;

/// A stride is taken as the line size when its time is at least this ratio of the next stride's.
pub const LINE_SIZE_DROP_RATIO: f64 = 1.7;
pub const SAVGOL_WINDOW: usize = 5;
pub const KNN_NEIGHBOURS: usize = 5;
pub const KNEEDLE_SENSITIVITY: f64 = 1.0;
pub const PIECEWISE_SEGMENTS: usize = 6;

/// Median of the values, `None` when empty.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sorted: Vec<f64> = values
        .iter()
        .copied()
        .sorted_by(|a, b| a.total_cmp(b))
        .collect();
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn split_fields(line: &str) -> impl Iterator<Item = &str> {
    line.split(',').map(str::trim).filter(|f| !f.is_empty())
}

// sizes may carry a unit, e.g. `1 MB`
fn leading_number(field: &str) -> &str {
    field.split_whitespace().next().unwrap_or("")
}

fn parse_field<T: std::str::FromStr>(field: &str, line: usize) -> Result<T, BenchError>
where
    T::Err: std::fmt::Display,
{
    field.parse::<T>().map_err(|e: T::Err| BenchError::Parse {
        line,
        message: format!("`{}`: {}", field, e),
    })
}

/// Reads `key,value...` rows, skipping blank lines and a non-numeric header.
fn read_rows<R: BufRead>(
    reader: R,
    min_fields: usize,
) -> Result<Vec<(usize, Vec<String>)>, BenchError> {
    let mut rows = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let fields: Vec<String> = split_fields(&line).map(str::to_owned).collect();
        if fields.is_empty() {
            continue;
        }
        if n == 0 && leading_number(&fields[0]).parse::<f64>().is_err() {
            continue;
        }
        if fields.len() < min_fields {
            return Err(BenchError::Parse {
                line: n + 1,
                message: format!("expected at least {} fields", min_fields),
            });
        }
        rows.push((n + 1, fields));
    }
    Ok(rows)
}

/// Median of the third column grouped by the first, for `associativity,element_index,access_time`
/// or (with `value_column` 1) `stride,milliseconds`.
pub fn read_grouped_medians<R: BufRead>(
    reader: R,
    value_column: usize,
) -> Result<Vec<(usize, f64)>, BenchError> {
    let mut groups: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    for (line, fields) in read_rows(reader, value_column + 1)? {
        let key: usize = parse_field(&fields[0], line)?;
        let value: f64 = parse_field(&fields[value_column], line)?;
        groups.entry(key).or_default().push(value);
    }
    Ok(groups
        .into_iter()
        .filter_map(|(key, values)| median(&values).map(|m| (key, m)))
        .collect())
}

/// Associativity right before the largest increase of the median access time.
pub fn predict_associativity(medians: &[(usize, f64)]) -> Option<usize> {
    let (step, change) = medians
        .iter()
        .tuple_windows()
        .map(|(a, b)| (b.1 - a.1).max(0.0))
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, change)| match best {
            Some((_, c)) if c >= change => best,
            _ => Some((i + 1, change)),
        })?;
    if change > 0.0 {
        Some(medians[step - 1].0)
    } else {
        None
    }
}

/// First stride whose time is at least 1.7x the next one, else the largest stride.
pub fn predict_line_size(medians: &[(usize, f64)]) -> Option<usize> {
    medians
        .iter()
        .tuple_windows()
        .find(|(a, b)| a.1 >= LINE_SIZE_DROP_RATIO * b.1)
        .map(|(a, _)| a.0)
        .or_else(|| medians.last().map(|m| m.0))
}

/// All loads of one working set size, pooled over passes.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeSummary {
    pub size: f64,
    pub mean: f64,
    pub median: f64,
    pub samples: usize,
}

/// Reads `size,load,load,...` rows as written by the working set sweeps.
pub fn read_size_summaries<R: BufRead>(reader: R) -> Result<Vec<SizeSummary>, BenchError> {
    let mut groups: Vec<(f64, Vec<f64>)> = Vec::new();
    for (line, fields) in read_rows(reader, 2)? {
        let size: f64 = parse_field(leading_number(&fields[0]), line)?;
        let loads = fields[1..]
            .iter()
            .map(|f| parse_field::<f64>(f, line))
            .collect::<Result<Vec<_>, _>>()?;
        match groups.iter_mut().find(|(s, _)| *s == size) {
            Some((_, values)) => values.extend(loads),
            None => groups.push((size, loads)),
        }
    }
    Ok(groups
        .into_iter()
        .filter_map(|(size, values)| {
            Some(SizeSummary {
                size,
                mean: mean(&values)?,
                median: median(&values)?,
                samples: values.len(),
            })
        })
        .collect())
}

/// Savitzky-Golay filter, window 5, cubic fit.
///
/// The two points at each end are taken from the cubic fitted to the first
/// (last) five samples. Fewer than five samples are returned as is.
pub fn savgol5(y: &[f64]) -> Vec<f64> {
    const CENTRE: [f64; SAVGOL_WINDOW] = [-3.0, 12.0, 17.0, 12.0, -3.0];
    const CENTRE_NORM: f64 = 35.0;
    const FIRST: [f64; SAVGOL_WINDOW] = [69.0, 4.0, -6.0, 4.0, -1.0];
    const FIRST_NORM: f64 = 70.0;
    const SECOND: [f64; SAVGOL_WINDOW] = [2.0, 27.0, 12.0, -8.0, 2.0];
    const SECOND_NORM: f64 = 35.0;

    let n = y.len();
    if n < SAVGOL_WINDOW {
        return y.to_vec();
    }
    let apply = |coefficients: &[f64], window: &[f64], norm: f64| {
        coefficients.iter().zip(window).map(|(c, v)| c * v).sum::<f64>() / norm
    };
    let reversed = |c: &[f64; SAVGOL_WINDOW]| -> Vec<f64> { c.iter().rev().copied().collect() };
    let half = SAVGOL_WINDOW / 2;
    let head = &y[..SAVGOL_WINDOW];
    let tail = &y[n - SAVGOL_WINDOW..];
    (0..n)
        .map(|i| match i {
            0 => apply(&FIRST[..], head, FIRST_NORM),
            1 => apply(&SECOND[..], head, SECOND_NORM),
            i if i == n - 2 => apply(&reversed(&SECOND)[..], tail, SECOND_NORM),
            i if i == n - 1 => apply(&reversed(&FIRST)[..], tail, FIRST_NORM),
            i => apply(&CENTRE[..], &y[i - half..=i + half], CENTRE_NORM),
        })
        .collect()
}

/// Uniform k-nearest-neighbour regression evaluated at every sample. `x` must be sorted.
pub fn knn_smooth(x: &[f64], y: &[f64], k: usize) -> Vec<f64> {
    let n = x.len().min(y.len());
    let k = k.clamp(1, n.max(1));
    (0..n)
        .map(|i| {
            // grow [lo, hi) around i, always taking the closer neighbour
            let (mut lo, mut hi) = (i, i + 1);
            while hi - lo < k {
                let take_left = lo > 0 && (hi >= n || x[i] - x[lo - 1] <= x[hi] - x[i]);
                if take_left {
                    lo -= 1;
                } else {
                    hi += 1;
                }
            }
            y[lo..hi].iter().sum::<f64>() / k as f64
        })
        .collect()
}

/// Kneedle knee detection for a concave increasing curve. `x` must be sorted.
pub fn find_knee(x: &[f64], y: &[f64], sensitivity: f64) -> Option<f64> {
    let n = x.len().min(y.len());
    if n < 3 {
        return None;
    }
    let normalise = |v: &[f64]| -> Option<Vec<f64>> {
        let (min, max) = v.iter().copied().minmax().into_option()?;
        if max <= min {
            return None;
        }
        Some(v.iter().map(|e| (e - min) / (max - min)).collect())
    };
    let x_n = normalise(&x[..n])?;
    let y_n = normalise(&y[..n])?;
    let difference: Vec<f64> = x_n.iter().zip(&y_n).map(|(x, y)| y - x).collect();
    let mean_gap = x_n.windows(2).map(|w| w[1] - w[0]).sum::<f64>() / (n - 1) as f64;

    // neighbours are clipped at the ends, so the endpoints can be extrema too
    let extremum = |i: usize, keep: fn(f64, f64) -> bool| {
        keep(difference[i], difference[i.saturating_sub(1)])
            && keep(difference[i], difference[(i + 1).min(n - 1)])
    };
    let is_max: Vec<bool> = (0..n).map(|i| extremum(i, |a, b| a >= b)).collect();
    let is_min: Vec<bool> = (0..n).map(|i| extremum(i, |a, b| a <= b)).collect();

    let first_max = is_max.iter().position(|&m| m)?;
    let mut threshold = 0.0;
    let mut threshold_index = first_max;
    for i in first_max..n - 1 {
        if is_max[i] {
            threshold = difference[i] - sensitivity * mean_gap;
            threshold_index = i;
        }
        // a local minimum closes the current candidate
        if is_min[i] {
            threshold = 0.0;
        }
        if difference[i + 1] < threshold {
            return Some(x[threshold_index]);
        }
    }
    None
}

/// Least squares fit of the curve by `k` straight segments.
#[derive(Debug, Clone, PartialEq)]
pub struct PiecewiseFit {
    /// Segment bounds in `x`, both ends included, `k + 1` values.
    pub breakpoints: Vec<f64>,
    pub sse: f64,
}

impl PiecewiseFit {
    /// The bound between the last two segments.
    pub fn last_breakpoint(&self) -> Option<f64> {
        self.breakpoints
            .len()
            .checked_sub(2)
            .filter(|&i| i > 0)
            .map(|i| self.breakpoints[i])
    }
}

/// Running sums for O(1) least squares on any sample range.
struct PrefixSums {
    x: Vec<f64>,
    y: Vec<f64>,
    xx: Vec<f64>,
    xy: Vec<f64>,
    yy: Vec<f64>,
}

impl PrefixSums {
    fn new(x: &[f64], y: &[f64]) -> PrefixSums {
        // shift to the first sample to keep the sums small
        let (x0, y0) = (x[0], y[0]);
        let mut sums = PrefixSums {
            x: Vec::with_capacity(x.len() + 1),
            y: Vec::with_capacity(x.len() + 1),
            xx: Vec::with_capacity(x.len() + 1),
            xy: Vec::with_capacity(x.len() + 1),
            yy: Vec::with_capacity(x.len() + 1),
        };
        let mut acc = [0.0f64; 5];
        let push = |sums: &mut PrefixSums, acc: &[f64; 5]| {
            sums.x.push(acc[0]);
            sums.y.push(acc[1]);
            sums.xx.push(acc[2]);
            sums.xy.push(acc[3]);
            sums.yy.push(acc[4]);
        };
        push(&mut sums, &acc);
        for (&a, &b) in x.iter().zip(y) {
            let (a, b) = (a - x0, b - y0);
            acc[0] += a;
            acc[1] += b;
            acc[2] += a * a;
            acc[3] += a * b;
            acc[4] += b * b;
            push(&mut sums, &acc);
        }
        sums
    }

    /// Residual sum of squares of the best line through samples `start..=end`.
    fn line_sse(&self, start: usize, end: usize) -> f64 {
        let m = (end - start + 1) as f64;
        let range = |v: &[f64]| v[end + 1] - v[start];
        let (sx, sy) = (range(&self.x), range(&self.y));
        let sxx = range(&self.xx) - sx * sx / m;
        let sxy = range(&self.xy) - sx * sy / m;
        let syy = range(&self.yy) - sy * sy / m;
        let sse = if sxx > 0.0 { syy - sxy * sxy / sxx } else { syy };
        sse.max(0.0)
    }
}

/// Splits the curve into `segments` straight pieces minimising the total squared error.
///
/// Breakpoints sit on samples and neighbouring segments share their boundary
/// sample. `x` must be sorted. `None` with fewer than two samples.
pub fn piecewise_linear_fit(x: &[f64], y: &[f64], segments: usize) -> Option<PiecewiseFit> {
    let n = x.len().min(y.len());
    if n < 2 || segments == 0 {
        return None;
    }
    let k = segments.min(n - 1);
    let sums = PrefixSums::new(&x[..n], &y[..n]);

    // best[j][e]: error of j segments covering samples 0..=e, with e the last bound
    let mut best = vec![vec![f64::INFINITY; n]; k + 1];
    let mut from = vec![vec![0usize; n]; k + 1];
    best[0][0] = 0.0;
    for j in 1..=k {
        for e in j..n {
            for s in (j - 1)..e {
                let prev = best[j - 1][s];
                if !prev.is_finite() {
                    continue;
                }
                let cost = prev + sums.line_sse(s, e);
                if cost < best[j][e] {
                    best[j][e] = cost;
                    from[j][e] = s;
                }
            }
        }
    }

    let mut bounds = vec![n - 1];
    let mut e = n - 1;
    for j in (1..=k).rev() {
        e = from[j][e];
        bounds.push(e);
    }
    bounds.reverse();
    Some(PiecewiseFit {
        breakpoints: bounds.iter().map(|&i| x[i]).collect(),
        sse: best[k][n - 1],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    /// Sweep over the known L3 sizes; the knee bounds the largest cache.
    Maximum,
    /// Fine sweep up to a known bound; the knee estimates the capacity.
    Estimated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheSizeReport {
    pub summaries: Vec<SizeSummary>,
    pub smoothed: Vec<f64>,
    pub knee: Option<f64>,
    /// Piecewise fit of the smoothed curve, estimated sweeps only.
    pub segments: Option<PiecewiseFit>,
}

pub fn analyse_cache_size(summaries: Vec<SizeSummary>, kind: SweepKind) -> CacheSizeReport {
    let x: Vec<f64> = summaries.iter().map(|s| s.size).collect();
    let smoothed = match kind {
        SweepKind::Maximum => savgol5(&summaries.iter().map(|s| s.mean).collect::<Vec<_>>()),
        SweepKind::Estimated => knn_smooth(
            &x,
            &summaries.iter().map(|s| s.median).collect::<Vec<_>>(),
            KNN_NEIGHBOURS,
        ),
    };
    let knee = find_knee(&x, &smoothed, KNEEDLE_SENSITIVITY);
    let segments = match kind {
        SweepKind::Maximum => None,
        SweepKind::Estimated => piecewise_linear_fit(&x, &smoothed, PIECEWISE_SEGMENTS),
    };
    CacheSizeReport {
        summaries,
        smoothed,
        knee,
        segments,
    }
}
