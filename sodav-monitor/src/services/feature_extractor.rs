//! Audio feature extraction and music/speech gating
//!
//! Computes the spectral and rhythm features the recognition pipeline
//! keys on: STFT band energies, onset-autocorrelation rhythm strength,
//! MFCC and chroma means, and the blended music-likelihood score that
//! gates recognition. Windows scoring below the gate never reach the
//! fingerprint or provider stages.

use crate::error::{DetectError, DetectResult};
use crate::types::AudioFeatures;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::f64::consts::PI;

const FFT_SIZE: usize = 2048;
const HOP_LENGTH: usize = 512;
const N_MELS: usize = 26;
const N_MFCC: usize = 13;
const N_CHROMA: usize = 12;
const PRE_EMPHASIS: f64 = 0.97;

/// Minimum samples the analyzer accepts after decoding.
pub const MIN_SAMPLES: usize = 1024;

/// Audio feature extractor, one per worker.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    sample_rate: u32,
}

impl FeatureExtractor {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Extract the full feature set from one mono PCM window.
    pub fn analyze(&self, samples: &[f32]) -> DetectResult<AudioFeatures> {
        if samples.is_empty() {
            return Err(DetectError::InvalidAudio("empty buffer".to_string()));
        }
        if samples.len() < MIN_SAMPLES {
            return Err(DetectError::TooShort {
                samples: samples.len(),
            });
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(DetectError::InvalidAudio(
                "non-finite samples in buffer".to_string(),
            ));
        }
        let first = samples[0];
        if samples.iter().all(|s| (*s - first).abs() < 1e-9) {
            return Err(DetectError::InvalidAudio("DC-only buffer".to_string()));
        }

        let sr = self.sample_rate as f64;

        // Pre-emphasis sharpens onsets and rebalances the band split
        let emphasized: Vec<f64> = std::iter::once(samples[0] as f64)
            .chain(
                samples
                    .windows(2)
                    .map(|w| w[1] as f64 - PRE_EMPHASIS * w[0] as f64),
            )
            .collect();

        let spectrogram = stft(&emphasized, FFT_SIZE, HOP_LENGTH);
        if spectrogram.is_empty() {
            return Err(DetectError::TooShort {
                samples: samples.len(),
            });
        }
        let freqs = bin_frequencies(FFT_SIZE, sr);

        let (bass_pct, mid_pct, high_pct) = band_energy_percentages(&spectrogram, &freqs);
        let onset_env = onset_envelope(&spectrogram);
        let rhythm_strength = rhythm_strength(&onset_env);
        let tempo_bpm = estimate_tempo(&onset_env, sr);
        let spectral_flux = mean_flux(&spectrogram);

        let centroids: Vec<f64> = spectrogram
            .iter()
            .map(|frame| spectral_centroid(frame, &freqs))
            .collect();
        let centroid_mean = mean(&centroids);
        let centroid_variance = variance(&centroids, centroid_mean);

        let bandwidths: Vec<f64> = spectrogram
            .iter()
            .zip(centroids.iter())
            .map(|(frame, c)| spectral_bandwidth(frame, &freqs, *c))
            .collect();
        let rolloffs: Vec<f64> = spectrogram
            .iter()
            .map(|frame| spectral_rolloff(frame, &freqs, 0.85))
            .collect();

        let mfcc_mean = mfcc_mean(&spectrogram, sr);
        let chroma_mean = {
            let frames = chroma_frames(&spectrogram, &freqs);
            mean_vectors(&frames, N_CHROMA)
        };

        let zero_crossing_rate = zero_crossing_rate(samples);
        let rms_energy = rms(samples);

        let music_likelihood = music_likelihood(
            bass_pct,
            mid_pct,
            high_pct,
            rhythm_strength,
            spectral_flux,
            centroid_variance,
        );

        if !music_likelihood.is_finite() || !centroid_mean.is_finite() {
            return Err(DetectError::InvalidAudio(
                "analysis produced non-finite values".to_string(),
            ));
        }

        Ok(AudioFeatures {
            mfcc_mean,
            chroma_mean,
            spectral_centroid: centroid_mean,
            spectral_bandwidth: mean(&bandwidths),
            spectral_rolloff: mean(&rolloffs),
            zero_crossing_rate,
            rms_energy,
            tempo_bpm,
            bass_pct,
            mid_pct,
            high_pct,
            rhythm_strength,
            spectral_flux,
            centroid_variance,
            music_likelihood,
            duration_s: samples.len() as f64 / sr,
        })
    }

    /// Music gate: strong overall score plus minimum bass, mid and rhythm
    /// content. Speech and jingles typically fail the bass or rhythm floor.
    pub fn is_music(&self, features: &AudioFeatures) -> bool {
        features.music_likelihood > 60.0
            && features.bass_pct > 20.0
            && features.mid_pct > 15.0
            && features.rhythm_strength > 30.0
    }
}

/// Magnitude spectrogram: one Vec per frame, FFT_SIZE/2 bins.
pub(crate) fn stft(samples: &[f64], fft_size: usize, hop: usize) -> Vec<Vec<f64>> {
    if samples.len() < fft_size {
        return Vec::new();
    }

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(fft_size);

    let window: Vec<f64> = (0..fft_size)
        .map(|n| 0.5 * (1.0 - (2.0 * PI * n as f64 / (fft_size as f64 - 1.0)).cos()))
        .collect();

    let n_frames = (samples.len() - fft_size) / hop + 1;
    let mut frames = Vec::with_capacity(n_frames);
    let mut buffer: Vec<Complex<f64>> = vec![Complex::new(0.0, 0.0); fft_size];

    for i in 0..n_frames {
        let start = i * hop;
        for (j, slot) in buffer.iter_mut().enumerate() {
            *slot = Complex::new(samples[start + j] * window[j], 0.0);
        }
        fft.process(&mut buffer);
        frames.push(
            buffer[..fft_size / 2]
                .iter()
                .map(|c| c.norm() / fft_size as f64)
                .collect(),
        );
    }

    frames
}

pub(crate) fn bin_frequencies(fft_size: usize, sample_rate: f64) -> Vec<f64> {
    (0..fft_size / 2)
        .map(|k| k as f64 * sample_rate / fft_size as f64)
        .collect()
}

/// Bass/mid/high shares of total spectral energy, in percent.
fn band_energy_percentages(spectrogram: &[Vec<f64>], freqs: &[f64]) -> (f64, f64, f64) {
    let n_frames = spectrogram.len() as f64;
    let mut band_sums = [0.0f64; 3];
    let mut band_bins = [0usize; 3];

    for (bin, freq) in freqs.iter().enumerate() {
        let band = if *freq < 250.0 {
            0
        } else if *freq < 4000.0 {
            1
        } else {
            2
        };
        band_bins[band] += 1;
        for frame in spectrogram {
            band_sums[band] += frame[bin];
        }
    }

    // Mean magnitude per band bin, averaged over time
    let mut energies = [0.0f64; 3];
    for band in 0..3 {
        if band_bins[band] > 0 {
            energies[band] = band_sums[band] / (band_bins[band] as f64 * n_frames) * 100.0;
        }
    }

    let total: f64 = energies.iter().sum();
    if total > 0.0 {
        for e in energies.iter_mut() {
            *e = *e / total * 100.0;
        }
    }

    (energies[0], energies[1], energies[2])
}

/// Half-wave-rectified spectral flux per frame, peak-normalized.
fn onset_envelope(spectrogram: &[Vec<f64>]) -> Vec<f64> {
    let mut envelope: Vec<f64> = spectrogram
        .windows(2)
        .map(|pair| {
            pair[1]
                .iter()
                .zip(pair[0].iter())
                .map(|(cur, prev)| (cur - prev).max(0.0))
                .sum()
        })
        .collect();

    let peak = envelope.iter().cloned().fold(0.0f64, f64::max);
    if peak > 0.0 {
        for v in envelope.iter_mut() {
            *v /= peak;
        }
    }
    envelope
}

/// Rhythm strength from autocorrelation peak prominences, 0-100.
fn rhythm_strength(onset_env: &[f64]) -> f64 {
    if onset_env.is_empty() {
        return 0.0;
    }

    let ac = autocorrelate(onset_env);
    let peaks = find_peaks(&ac, 20, 0.05);
    if peaks.is_empty() {
        return 0.0;
    }

    let mean_prominence: f64 =
        peaks.iter().map(|p| p.prominence).sum::<f64>() / peaks.len() as f64;
    (mean_prominence * 100.0).clamp(0.0, 100.0)
}

/// Tempo from the strongest autocorrelation peak in the 60-200 BPM range.
fn estimate_tempo(onset_env: &[f64], sample_rate: f64) -> f64 {
    if onset_env.len() < 4 {
        return 0.0;
    }

    let ac = autocorrelate(onset_env);
    let frames_per_second = sample_rate / HOP_LENGTH as f64;
    let min_lag = (frames_per_second * 60.0 / 200.0).floor().max(1.0) as usize;
    let max_lag = ((frames_per_second * 60.0 / 60.0).ceil() as usize).min(ac.len().saturating_sub(1));

    if min_lag >= max_lag {
        return 0.0;
    }

    let mut best_lag = 0usize;
    let mut best_value = 0.0f64;
    for lag in min_lag..=max_lag {
        if ac[lag] > best_value {
            best_value = ac[lag];
            best_lag = lag;
        }
    }

    if best_lag == 0 {
        return 0.0;
    }
    60.0 * frames_per_second / best_lag as f64
}

/// Mean frame-to-frame change in total spectral energy.
fn mean_flux(spectrogram: &[Vec<f64>]) -> f64 {
    if spectrogram.len() < 2 {
        return 0.0;
    }
    let totals: Vec<f64> = spectrogram.iter().map(|f| f.iter().sum()).collect();
    let diffs: Vec<f64> = totals.windows(2).map(|w| w[1] - w[0]).collect();
    mean(&diffs)
}

pub(crate) fn spectral_centroid(frame: &[f64], freqs: &[f64]) -> f64 {
    let total: f64 = frame.iter().sum();
    if total < 1e-12 {
        return 0.0;
    }
    frame
        .iter()
        .zip(freqs.iter())
        .map(|(m, f)| m * f)
        .sum::<f64>()
        / total
}

fn spectral_bandwidth(frame: &[f64], freqs: &[f64], centroid: f64) -> f64 {
    let total: f64 = frame.iter().sum();
    if total < 1e-12 {
        return 0.0;
    }
    (frame
        .iter()
        .zip(freqs.iter())
        .map(|(m, f)| m * (f - centroid).powi(2))
        .sum::<f64>()
        / total)
        .sqrt()
}

fn spectral_rolloff(frame: &[f64], freqs: &[f64], fraction: f64) -> f64 {
    let total: f64 = frame.iter().sum();
    if total < 1e-12 {
        return 0.0;
    }
    let threshold = fraction * total;
    let mut cumulative = 0.0;
    for (m, f) in frame.iter().zip(freqs.iter()) {
        cumulative += m;
        if cumulative >= threshold {
            return *f;
        }
    }
    *freqs.last().unwrap_or(&0.0)
}

fn zero_crossing_rate(samples: &[f32]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    crossings as f64 / (samples.len() - 1) as f64
}

fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| (*s as f64).powi(2)).sum::<f64>() / samples.len() as f64).sqrt()
}

/// Per-frame chroma vectors: STFT bins folded onto 12 semitone classes,
/// each frame normalized to its own maximum.
pub(crate) fn chroma_frames(spectrogram: &[Vec<f64>], freqs: &[f64]) -> Vec<Vec<f64>> {
    // Map each bin to its pitch class once
    let classes: Vec<Option<usize>> = freqs
        .iter()
        .map(|f| {
            if *f < 27.5 {
                None
            } else {
                let midi = 69.0 + 12.0 * (f / 440.0).log2();
                Some(midi.round().rem_euclid(12.0) as usize % 12)
            }
        })
        .collect();

    spectrogram
        .iter()
        .map(|frame| {
            let mut chroma = vec![0.0f64; N_CHROMA];
            for (bin, magnitude) in frame.iter().enumerate() {
                if let Some(class) = classes[bin] {
                    chroma[class] += magnitude;
                }
            }
            let peak = chroma.iter().cloned().fold(0.0f64, f64::max);
            if peak > 0.0 {
                for c in chroma.iter_mut() {
                    *c /= peak;
                }
            }
            chroma
        })
        .collect()
}

/// Mean MFCC vector: mel filterbank + log + DCT-II per frame, averaged.
fn mfcc_mean(spectrogram: &[Vec<f64>], sample_rate: f64) -> Vec<f64> {
    let filterbank = mel_filterbank(N_MELS, FFT_SIZE / 2, sample_rate);

    let frames: Vec<Vec<f64>> = spectrogram
        .iter()
        .map(|frame| {
            let power: Vec<f64> = frame.iter().map(|m| m * m).collect();
            let mel_log: Vec<f64> = filterbank
                .iter()
                .map(|filter| {
                    let energy: f64 = filter
                        .iter()
                        .zip(power.iter())
                        .map(|(w, p)| w * p)
                        .sum();
                    (energy + 1e-10).ln()
                })
                .collect();
            dct_ii(&mel_log, N_MFCC)
        })
        .collect();

    mean_vectors(&frames, N_MFCC)
}

/// Triangular mel filterbank, HTK mel scale.
fn mel_filterbank(n_mels: usize, n_bins: usize, sample_rate: f64) -> Vec<Vec<f64>> {
    let hz_to_mel = |hz: f64| 2595.0 * (1.0 + hz / 700.0).log10();
    let mel_to_hz = |mel: f64| 700.0 * (10f64.powf(mel / 2595.0) - 1.0);

    let mel_max = hz_to_mel(sample_rate / 2.0);
    let points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
        .collect();

    let bin_hz = sample_rate / (2.0 * n_bins as f64);
    (0..n_mels)
        .map(|m| {
            let (left, center, right) = (points[m], points[m + 1], points[m + 2]);
            (0..n_bins)
                .map(|bin| {
                    let f = bin as f64 * bin_hz;
                    if f <= left || f >= right {
                        0.0
                    } else if f <= center {
                        (f - left) / (center - left)
                    } else {
                        (right - f) / (right - center)
                    }
                })
                .collect()
        })
        .collect()
}

fn dct_ii(input: &[f64], n_out: usize) -> Vec<f64> {
    let n = input.len() as f64;
    (0..n_out)
        .map(|k| {
            input
                .iter()
                .enumerate()
                .map(|(i, x)| x * (PI * k as f64 * (i as f64 + 0.5) / n).cos())
                .sum()
        })
        .collect()
}

/// Blended music-likelihood score, 0-100.
///
/// Weighted band/rhythm/flux sum, blended 0.7/0.3 with a frequency
/// balance term, with a 20 % boost when both rhythm and balance are
/// strong.
fn music_likelihood(
    bass: f64,
    mid: f64,
    high: f64,
    rhythm: f64,
    flux: f64,
    centroid_var: f64,
) -> f64 {
    let flux_norm = (flux * 100.0).min(100.0).max(0.0);
    let var_norm = (centroid_var / 1000.0).min(100.0).max(0.0);

    let balance =
        100.0 - ((bass - 33.3).abs() + (mid - 33.3).abs() + (high - 33.3).abs()) / 3.0;

    let weighted = 0.25 * bass + 0.15 * mid + 0.10 * high + 0.30 * rhythm
        + 0.10 * flux_norm
        + 0.10 * var_norm;

    let mut score = weighted * 0.7 + balance * 0.3;
    if rhythm > 70.0 && balance > 60.0 {
        score *= 1.2;
    }
    score.clamp(0.0, 100.0)
}

fn autocorrelate(signal: &[f64]) -> Vec<f64> {
    let n = signal.len();
    let mut ac = vec![0.0f64; n];
    for lag in 0..n {
        let mut sum = 0.0;
        for i in 0..n - lag {
            sum += signal[i] * signal[i + lag];
        }
        ac[lag] = sum;
    }
    if ac[0] > 0.0 {
        let norm = ac[0];
        for v in ac.iter_mut() {
            *v /= norm;
        }
    }
    ac
}

struct Peak {
    prominence: f64,
}

/// Local maxima with a minimum spacing and prominence floor.
fn find_peaks(signal: &[f64], min_distance: usize, min_prominence: f64) -> Vec<Peak> {
    let mut peaks = Vec::new();
    let mut last_peak_index: Option<usize> = None;

    for i in 1..signal.len().saturating_sub(1) {
        if signal[i] <= signal[i - 1] || signal[i] < signal[i + 1] {
            continue;
        }
        if let Some(last) = last_peak_index {
            if i - last < min_distance {
                continue;
            }
        }

        // Prominence: drop to the lowest valley before a higher point on
        // each side, take the higher of the two bases.
        let mut left_base = signal[i];
        for j in (0..i).rev() {
            if signal[j] > signal[i] {
                break;
            }
            left_base = left_base.min(signal[j]);
        }
        let mut right_base = signal[i];
        for value in signal.iter().skip(i + 1) {
            if *value > signal[i] {
                break;
            }
            right_base = right_base.min(*value);
        }
        let prominence = signal[i] - left_base.max(right_base);

        if prominence >= min_prominence {
            peaks.push(Peak { prominence });
            last_peak_index = Some(i);
        }
    }

    peaks
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn variance(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

fn mean_vectors(frames: &[Vec<f64>], width: usize) -> Vec<f64> {
    let mut out = vec![0.0f64; width];
    if frames.is_empty() {
        return out;
    }
    for frame in frames {
        for (slot, value) in out.iter_mut().zip(frame.iter()) {
            *slot += value;
        }
    }
    for slot in out.iter_mut() {
        *slot /= frames.len() as f64;
    }
    out
}
