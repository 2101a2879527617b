//! Applies a registered set of pure functions to a decoded RAW frame,
//! producing a name → value map IndexStore attaches to a descriptor.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::error::FeatureError;
use crate::variant::Variant;

pub const RAW8: u8 = 0x38;
pub const RAW10: u8 = 0x39;
pub const RAW12: u8 = 0x3A;

type ExtractorFn = dyn Fn(&[u16], u16, u16, u8) -> Variant + Send + Sync;

struct Extractor {
    func: Arc<ExtractorFn>,
    enabled: bool,
}

/// Unpacks a raw byte buffer into per-pixel `u16` samples for a recognised
/// pixel format. `Ok(None)` for an unrecognised format (not an error: the
/// caller may legitimately probe formats it doesn't know); `Err` for a
/// recognised format whose buffer is too short to hold a full frame.
///
/// `RAW10` packs 4 pixels into 5 bytes and `RAW12` packs 2 pixels into 3
/// bytes, both MSB-first within the packed group.
pub fn unpack_samples(
    data: &[u8],
    width: u16,
    height: u16,
    format: u8,
) -> Result<Option<Vec<u16>>, FeatureError> {
    let pixel_count = width as usize * height as usize;
    match format {
        RAW8 => {
            if data.len() < pixel_count {
                return Err(FeatureError::FrameTooSmall {
                    width,
                    height,
                    needed: pixel_count,
                    actual: data.len(),
                });
            }
            Ok(Some(data[..pixel_count].iter().map(|&b| b as u16).collect()))
        }
        RAW10 => {
            let needed = pixel_count.div_ceil(4) * 5;
            if data.len() < needed {
                return Err(FeatureError::FrameTooSmall {
                    width,
                    height,
                    needed,
                    actual: data.len(),
                });
            }
            let mut samples = Vec::with_capacity(pixel_count);
            for group in data.chunks(5) {
                if group.len() < 5 {
                    break;
                }
                let p0 = (group[0] as u16) << 2 | (group[4] >> 6) as u16;
                let p1 = (group[1] as u16) << 2 | ((group[4] >> 4) & 0x3) as u16;
                let p2 = (group[2] as u16) << 2 | ((group[4] >> 2) & 0x3) as u16;
                let p3 = (group[3] as u16) << 2 | (group[4] & 0x3) as u16;
                samples.extend_from_slice(&[p0, p1, p2, p3]);
            }
            samples.truncate(pixel_count);
            Ok(Some(samples))
        }
        RAW12 => {
            let needed = pixel_count.div_ceil(2) * 3;
            if data.len() < needed {
                return Err(FeatureError::FrameTooSmall {
                    width,
                    height,
                    needed,
                    actual: data.len(),
                });
            }
            let mut samples = Vec::with_capacity(pixel_count);
            for group in data.chunks(3) {
                if group.len() < 3 {
                    break;
                }
                let p0 = (group[0] as u16) << 4 | (group[2] >> 4) as u16;
                let p1 = (group[1] as u16) << 4 | (group[2] & 0xF) as u16;
                samples.extend_from_slice(&[p0, p1]);
            }
            samples.truncate(pixel_count);
            Ok(Some(samples))
        }
        _ => Ok(None),
    }
}

fn extract_average(samples: &[u16], _w: u16, _h: u16, _format: u8) -> Variant {
    if samples.is_empty() {
        return Variant::Real(0.0);
    }
    let sum: u64 = samples.iter().map(|&s| s as u64).sum();
    Variant::Real(sum as f64 / samples.len() as f64)
}

fn extract_max(samples: &[u16], _w: u16, _h: u16, _format: u8) -> Variant {
    Variant::Int(samples.iter().copied().max().unwrap_or(0) as i64)
}

fn extract_min(samples: &[u16], _w: u16, _h: u16, _format: u8) -> Variant {
    Variant::Int(samples.iter().copied().min().unwrap_or(0) as i64)
}

/// Fixed per-format sample ceiling a histogram bins over, so two frames with
/// identical content but different single-pixel outliers still land in the
/// same bins.
fn format_max_value(format: u8) -> u32 {
    match format {
        RAW10 => 1023,
        RAW12 => 4095,
        _ => 255,
    }
}

fn extract_histogram(samples: &[u16], _w: u16, _h: u16, format: u8) -> Variant {
    let max_val = format_max_value(format);
    let mut bins = vec![0i64; 16];
    let bin_width = (max_val as f64 + 1.0) / 16.0;
    for &s in samples {
        let idx = ((s as f64) / bin_width) as usize;
        bins[idx.min(15)] += 1;
    }
    Variant::IntList(bins)
}

fn extract_edge_count(samples: &[u16], width: u16, height: u16, _format: u8) -> Variant {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 || samples.len() < w * h {
        return Variant::Int(0);
    }
    let mut count: i64 = 0;
    for y in 0..h {
        for x in 0..w {
            let v = samples[y * w + x] as i32;
            if x + 1 < w {
                let right = samples[y * w + x + 1] as i32;
                if (v - right).abs() > 30 {
                    count += 1;
                }
            }
            if y + 1 < h {
                let below = samples[(y + 1) * w + x] as i32;
                if (v - below).abs() > 30 {
                    count += 1;
                }
            }
        }
    }
    Variant::Int(count)
}

fn extract_noise_level(samples: &[u16], width: u16, height: u16, _format: u8) -> Variant {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 || samples.len() < w * h {
        return Variant::Real(0.0);
    }
    const BLOCK: usize = 8;
    let mut block_stddevs = Vec::new();
    let mut by = 0;
    while by < h {
        let mut bx = 0;
        while bx < w {
            let mut values = Vec::new();
            for y in by..(by + BLOCK).min(h) {
                for x in bx..(bx + BLOCK).min(w) {
                    values.push(samples[y * w + x] as f64);
                }
            }
            if !values.is_empty() {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                let variance =
                    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
                block_stddevs.push(variance.sqrt());
            }
            bx += BLOCK;
        }
        by += BLOCK;
    }
    if block_stddevs.is_empty() {
        return Variant::Real(0.0);
    }
    Variant::Real(block_stddevs.iter().sum::<f64>() / block_stddevs.len() as f64)
}

/// Registry of named feature extractors plus the rayon pool that runs them.
pub struct FeatureExtractor {
    extractors: RwLock<BTreeMap<String, Extractor>>,
    pool: rayon::ThreadPool,
}

impl FeatureExtractor {
    pub fn new(worker_threads: usize) -> Result<Self, std::io::Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_threads)
            .build()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        let extractor = FeatureExtractor {
            extractors: RwLock::new(BTreeMap::new()),
            pool,
        };

        extractor.register("average", extract_average);
        extractor.register("max", extract_max);
        extractor.register("min", extract_min);
        extractor.register("histogram", extract_histogram);
        extractor.register("edge_count", extract_edge_count);
        extractor.register("noise_level", extract_noise_level);
        Ok(extractor)
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        f: impl Fn(&[u16], u16, u16, u8) -> Variant + Send + Sync + 'static,
    ) {
        self.extractors.write().insert(
            name.into(),
            Extractor {
                func: Arc::new(f),
                enabled: true,
            },
        );
    }

    pub fn enable(&self, name: &str, enabled: bool) {
        if let Some(e) = self.extractors.write().get_mut(name) {
            e.enabled = enabled;
        }
    }

    pub fn available_features(&self) -> Vec<String> {
        self.extractors.read().keys().cloned().collect()
    }

    /// Unpacks `data` per `format` and runs every enabled feature in
    /// parallel across the worker pool. A panicking feature closure is
    /// caught and simply omitted from the result; other features are
    /// unaffected. Always includes `extraction_time_ms`.
    ///
    /// Returns `Err` only when `data` is too short for `format`'s claimed
    /// frame size; an unrecognised `format` yields a result containing just
    /// `extraction_time_ms`.
    pub fn extract(
        &self,
        data: &[u8],
        width: u16,
        height: u16,
        format: u8,
    ) -> Result<BTreeMap<String, Variant>, FeatureError> {
        let start = Instant::now();
        let mut result = BTreeMap::new();

        let Some(samples) = unpack_samples(data, width, height, format)? else {
            result.insert(
                "extraction_time_ms".to_string(),
                Variant::Int(start.elapsed().as_millis() as i64),
            );
            return Ok(result);
        };

        let enabled: Vec<(String, Arc<ExtractorFn>)> = {
            let guard = self.extractors.read();
            guard
                .iter()
                .filter(|(_, e)| e.enabled)
                .map(|(name, e)| (name.clone(), Arc::clone(&e.func)))
                .collect()
        };

        let outcomes: Vec<(String, Option<Variant>)> = self.pool.install(|| {
            use rayon::prelude::*;
            enabled
                .par_iter()
                .map(|(name, func)| {
                    let samples_ref = &samples;
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        (*func)(samples_ref, width, height, format)
                    }));
                    match outcome {
                        Ok(value) => (name.clone(), Some(value)),
                        Err(_) => {
                            tracing::warn!(feature = %name, "feature extractor panicked; omitting");
                            (name.clone(), None)
                        }
                    }
                })
                .collect()
        });

        for (name, value) in outcomes {
            if let Some(v) = value {
                result.insert(name, v);
            }
        }

        result.insert(
            "extraction_time_ms".to_string(),
            Variant::Int(start.elapsed().as_millis() as i64),
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw8_unpacks_one_byte_per_pixel() {
        let data = vec![1, 2, 3, 4];
        let samples = unpack_samples(&data, 2, 2, RAW8).unwrap().unwrap();
        assert_eq!(samples, vec![1, 2, 3, 4]);
    }

    #[test]
    fn raw10_unpacks_four_pixels_per_five_bytes() {
        // All bits set except within the packed group, to sanity-check shifts.
        let data = vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        let samples = unpack_samples(&data, 4, 1, RAW10).unwrap().unwrap();
        assert_eq!(samples, vec![1023, 1023, 1023, 1023]);
    }

    #[test]
    fn raw12_unpacks_two_pixels_per_three_bytes() {
        let data = vec![0xFF, 0xFF, 0xFF];
        let samples = unpack_samples(&data, 2, 1, RAW12).unwrap().unwrap();
        assert_eq!(samples, vec![4095, 4095]);
    }

    #[test]
    fn unrecognised_format_returns_none() {
        assert!(unpack_samples(&[1, 2, 3], 1, 1, 0xAA).unwrap().is_none());
    }

    #[test]
    fn undersized_frame_yields_frame_too_small() {
        let err = unpack_samples(&[1, 2, 3], 4, 4, RAW8).unwrap_err();
        assert!(matches!(err, FeatureError::FrameTooSmall { needed: 16, actual: 3, .. }));
    }

    #[test]
    fn histogram_is_stable_under_single_pixel_outliers() {
        // Two otherwise-identical frames differing only in one outlier pixel
        // must land the rest of their pixels in the same bins.
        let mut a = vec![10u16; 16];
        let mut b = a.clone();
        a[0] = 10;
        b[0] = 250;
        let hist_a = extract_histogram(&a, 4, 4, RAW8);
        let hist_b = extract_histogram(&b, 4, 4, RAW8);
        let Variant::IntList(bins_a) = hist_a else { panic!("expected IntList") };
        let Variant::IntList(bins_b) = hist_b else { panic!("expected IntList") };
        // All 15 shared pixels (value 10) fall in the same bin in both cases.
        let shared_bin_a: i64 = bins_a.iter().enumerate().filter(|(i, _)| *i != 15).map(|(_, c)| *c).sum();
        let shared_bin_b: i64 = bins_b.iter().enumerate().filter(|(i, _)| *i != 15).map(|(_, c)| *c).sum();
        assert_eq!(shared_bin_a, shared_bin_b);
    }

    #[test]
    fn extract_includes_all_builtins_and_timing() {
        let extractor = FeatureExtractor::new(2).unwrap();
        let data = vec![10u8; 16];
        let result = extractor.extract(&data, 4, 4, RAW8).unwrap();
        assert!(result.contains_key("average"));
        assert!(result.contains_key("max"));
        assert!(result.contains_key("min"));
        assert!(result.contains_key("histogram"));
        assert!(result.contains_key("edge_count"));
        assert!(result.contains_key("noise_level"));
        assert!(result.contains_key("extraction_time_ms"));
    }

    #[test]
    fn disabled_feature_is_excluded() {
        let extractor = FeatureExtractor::new(2).unwrap();
        extractor.enable("histogram", false);
        let data = vec![10u8; 16];
        let result = extractor.extract(&data, 4, 4, RAW8).unwrap();
        assert!(!result.contains_key("histogram"));
        assert!(result.contains_key("average"));
    }

    #[test]
    fn panicking_feature_is_omitted_without_affecting_others() {
        let extractor = FeatureExtractor::new(2).unwrap();
        extractor.register("boom", |_s, _w, _h, _f| panic!("synthetic failure"));
        let data = vec![10u8; 16];
        let result = extractor.extract(&data, 4, 4, RAW8).unwrap();
        assert!(!result.contains_key("boom"));
        assert!(result.contains_key("average"));
    }

    #[test]
    fn unrecognised_format_yields_only_timing() {
        let extractor = FeatureExtractor::new(2).unwrap();
        let result = extractor.extract(&[1, 2, 3], 4, 4, 0xAA).unwrap();
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("extraction_time_ms"));
    }

    #[test]
    fn oversized_claim_propagates_frame_too_small_from_extract() {
        let extractor = FeatureExtractor::new(2).unwrap();
        let err = extractor.extract(&[1, 2, 3], 4, 4, RAW8).unwrap_err();
        assert!(matches!(err, FeatureError::FrameTooSmall { .. }));
    }
}
