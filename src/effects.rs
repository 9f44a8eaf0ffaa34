//! Effect stages applied to single waveforms.
//!
//! Every stage works in place on 16 bit samples and is controlled by a
//! single value in the range [0.0, 1.0]. Control values below `FX_EPSILON`
//! skip the stage entirely, leaving the samples untouched.
//!
//! Rendering applies the stages in a fixed order:
//!
//! ```text
//! normalize -> wavefold -> decimate -> metalize -> lowpass -> normalize
//! ```
//!
//! Distortion and slew limiting are shaping stages that are applied on
//! request to an already rendered waveform.

use super::Float;
use super::lowpass::{Harmonic, LowpassFilter};
use super::wavetable::to_sample;

use log::trace;
use serde::{Serialize, Deserialize};

pub const FX_EPSILON: Float = 0.001;
pub const NUM_FX_KINDS: usize = 7;

/// Control value at which Normalize leaves the waveform alone.
pub const NORMALIZE_OFF: Float = 0.5;
const NORMALIZE_FLOOR_GAIN: Float = 0.1;
const PEAK_LEVEL: i32 = i16::MAX as i32;

const WAVEFOLD_MAX_ORDER: Float = 50.0;
const DECIMATE_MAX_HOLD: Float = 64.0;
const METALIZE_MAX_FEEDBACK: Float = 0.95;
const LOWPASS_BASE_HZ: Float = 21000.0;
const LOWPASS_MIN_HZ: Float = 200.0;
const SLEW_MIN_RATIO: Float = 0.001;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FxKind {
    Normalize,
    Wavefold,
    Decimate,
    Metalize,
    Lowpass,
    Distort,
    SlewLimit,
}

impl FxKind {
    pub const ALL: [FxKind; NUM_FX_KINDS] = [
        FxKind::Normalize,
        FxKind::Wavefold,
        FxKind::Decimate,
        FxKind::Metalize,
        FxKind::Lowpass,
        FxKind::Distort,
        FxKind::SlewLimit,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// Effect controls of a single waveform.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FxParams {
    pub values: [Float; NUM_FX_KINDS],
}

impl Default for FxParams {
    fn default() -> Self {
        let mut values = [0.0; NUM_FX_KINDS];
        values[FxKind::Normalize.index()] = 1.0;
        FxParams{values}
    }
}

impl FxParams {
    /// Parameters with every stage switched off.
    pub fn bypass() -> FxParams {
        let mut values = [0.0; NUM_FX_KINDS];
        values[FxKind::Normalize.index()] = NORMALIZE_OFF;
        FxParams{values}
    }

    pub fn get(&self, kind: FxKind) -> Float {
        self.values[kind.index()]
    }

    /// Values are clamped to [0.0, 1.0].
    pub fn set(&mut self, kind: FxKind, value: Float) {
        self.values[kind.index()] = num::clamp(value, 0.0, 1.0);
    }
}

fn is_off(control: Float) -> bool {
    control < FX_EPSILON
}

fn peak(wave: &[i16]) -> i32 {
    wave.iter().map(|s| (*s as i32).abs()).max().unwrap_or(0)
}

// Write float values back to the wave, scaled so that the peak matches
// target_peak.
fn renormalize(wave: &mut [i16], values: &[Float], target_peak: i32) {
    let value_peak = values.iter().fold(0.0, |max: Float, v| max.max(v.abs()));
    if value_peak == 0.0 {
        for s in wave.iter_mut() {
            *s = 0;
        }
        return;
    }
    let scale = target_peak as Float / value_peak;
    for (s, v) in wave.iter_mut().zip(values.iter()) {
        *s = to_sample(*v * scale);
    }
}

/// Shift the waveform so that its integer mean becomes zero.
pub fn remove_dc_offset(wave: &mut [i16]) {
    if wave.is_empty() {
        return;
    }
    let sum: i64 = wave.iter().map(|s| *s as i64).sum();
    let mean = (sum / wave.len() as i64) as i32;
    if mean == 0 {
        return;
    }
    for s in wave.iter_mut() {
        *s = num::clamp(*s as i32 - mean, i16::MIN as i32, i16::MAX as i32) as i16;
    }
}

/// Change the level of the waveform.
///
/// Above 0.5 the gain moves from unity to full peak normalization, below it
/// the waveform is attenuated down to a floor gain. Exactly 0.5 leaves the
/// waveform untouched.
pub fn normalize(wave: &mut [i16], control: Float) {
    if is_off(control) || control == NORMALIZE_OFF {
        return;
    }
    remove_dc_offset(wave);
    let peak = peak(wave);
    if peak == 0 {
        return;
    }
    let gain = if control > NORMALIZE_OFF {
        let full_gain = PEAK_LEVEL as Float / peak as Float;
        1.0 + (full_gain - 1.0) * (control - NORMALIZE_OFF) / (1.0 - NORMALIZE_OFF)
    } else {
        NORMALIZE_FLOOR_GAIN + (1.0 - NORMALIZE_FLOOR_GAIN) * control / NORMALIZE_OFF
    };
    if (gain - 1.0).abs() < 1.0 / 32768.0 {
        return;
    }
    trace!("Normalizing with gain {}", gain);
    for s in wave.iter_mut() {
        *s = to_sample(*s as Float * gain);
    }
}

/// Chebyshev style wavefolder, sin(n * asin(x)) with n = 50^control.
pub fn wavefold(wave: &mut [i16], control: Float) {
    if is_off(control) {
        return;
    }
    let peak = peak(wave);
    if peak == 0 {
        return;
    }
    let order = WAVEFOLD_MAX_ORDER.powf(control);
    let values: Vec<Float> = wave.iter()
        .map(|s| {
            let x = num::clamp(*s as Float / peak as Float, -1.0, 1.0);
            (order * x.asin()).sin()
        })
        .collect();
    renormalize(wave, &values, peak);
}

/// Sample and hold with a hold length of up to 64 samples.
pub fn decimate(wave: &mut [i16], control: Float) {
    if is_off(control) {
        return;
    }
    let peak = peak(wave);
    let hold = DECIMATE_MAX_HOLD.powf(control).round().max(1.0) as usize;
    let mut held = 0.0;
    let values: Vec<Float> = wave.iter()
        .enumerate()
        .map(|(i, s)| {
            if i % hold == 0 {
                held = *s as Float;
            }
            held
        })
        .collect();
    renormalize(wave, &values, peak);
}

/// One-pole feedback against the previous output sample.
///
/// The filter runs around the buffer almost twice (2N - 1 steps), so the
/// state at the start of the cycle continues from the end of it.
pub fn metalize(wave: &mut [i16], control: Float) {
    if is_off(control) || wave.is_empty() {
        return;
    }
    let peak = peak(wave);
    let feedback = METALIZE_MAX_FEEDBACK * control;
    let len = wave.len();
    let mut values = vec![0.0; len];
    let mut prev: Float = 0.0;
    for i in 0..(2 * len - 1) {
        let index = i % len;
        let y = wave[index] as Float - feedback * prev;
        values[index] = y;
        prev = y;
    }
    renormalize(wave, &values, peak);
}

/// Cutoff ratio for the lowpass stage, relative to the given Nyquist frequency.
pub fn lowpass_cutoff_ratio(control: Float, nyquist_hz: Float) -> Float {
    let cutoff_hz = LOWPASS_BASE_HZ.powf(1.0 - control) + LOWPASS_MIN_HZ;
    (cutoff_hz / nyquist_hz).min(1.0)
}

/// Spectral lowpass, delegating the filtering to the given filter.
pub fn lowpass(wave: &mut [i16],
               control: Float,
               filter: &dyn LowpassFilter,
               scratch: &mut [Harmonic],
               nyquist_hz: Float) {
    if is_off(control) {
        return;
    }
    let ratio = lowpass_cutoff_ratio(control, nyquist_hz);
    trace!("Lowpass cutoff ratio {}", ratio);
    let input = wave.to_vec();
    filter.lowpass(&input, wave, scratch, ratio);
}

/// Soft clipper x(|x| + a) / (x^2 + (a - 1)|x| + 1) with a = 1 + 10 * control.
pub fn distort(wave: &mut [i16], control: Float) {
    if is_off(control) {
        return;
    }
    let a = 1.0 + 10.0 * control;
    for s in wave.iter_mut() {
        let x = *s as Float / 32768.0;
        let y = x * (x.abs() + a) / (x * x + (a - 1.0) * x.abs() + 1.0);
        *s = to_sample(y * PEAK_LEVEL as Float);
    }
}

/// Limit the change between neighbouring samples.
///
/// Afterwards a linear ramp is removed, so that the last sample ends up at
/// the level of the first one.
pub fn slew_limit(wave: &mut [i16], control: Float) {
    if is_off(control) || wave.len() < 2 {
        return;
    }
    let max_delta = SLEW_MIN_RATIO.powf(control) * PEAK_LEVEL as Float;
    let len = wave.len();
    let mut values = vec![0.0; len];
    let mut prev = wave[0] as Float;
    values[0] = prev;
    for i in 1..len {
        let delta = num::clamp(wave[i] as Float - prev, -max_delta, max_delta);
        prev += delta;
        values[i] = prev;
    }
    let drift = values[len - 1] - values[0];
    for (i, v) in values.iter().enumerate() {
        let ramp = drift * i as Float / (len - 1) as Float;
        wave[i] = to_sample(*v - ramp);
    }
}

/// Apply the fixed render chain that follows placing a waveform.
pub fn apply_render_chain(wave: &mut [i16],
                          params: &FxParams,
                          filter: &dyn LowpassFilter,
                          scratch: &mut [Harmonic],
                          nyquist_hz: Float) {
    normalize(wave, params.get(FxKind::Normalize));
    wavefold(wave, params.get(FxKind::Wavefold));
    decimate(wave, params.get(FxKind::Decimate));
    metalize(wave, params.get(FxKind::Metalize));
    lowpass(wave, params.get(FxKind::Lowpass), filter, scratch, nyquist_hz);
    normalize(wave, params.get(FxKind::Normalize));
}

/// Apply the shaping stages, distortion first.
pub fn apply_shaping(wave: &mut [i16], params: &FxParams) {
    distort(wave, params.get(FxKind::Distort));
    slew_limit(wave, params.get(FxKind::SlewLimit));
}

// ----------------------------------------------
//                  Unit tests
// ----------------------------------------------

#[cfg(test)]
use super::lowpass::FftLowpass;
#[cfg(test)]
use super::wavetable::WT_TABLE_LEN;

#[cfg(test)]
fn test_wave() -> Vec<i16> {
    // Sine plus a bit of third harmonic plus DC
    (0..WT_TABLE_LEN).map(|i| {
        let phase = i as Float / WT_TABLE_LEN as Float * 2.0 * std::f64::consts::PI as Float;
        (phase.sin() * 12000.0 + (phase * 3.0).sin() * 3000.0 + 800.0).round() as i16
    }).collect()
}

#[test]
fn zero_control_leaves_wave_untouched() {
    let filter = FftLowpass::new(WT_TABLE_LEN);
    let mut scratch = vec![Harmonic::new(0.0, 0.0); WT_TABLE_LEN];
    let reference = test_wave();
    let mut wave = reference.clone();

    wavefold(&mut wave, 0.0);
    decimate(&mut wave, 0.0);
    metalize(&mut wave, 0.0);
    lowpass(&mut wave, 0.0, &filter, &mut scratch, 22050.0);
    distort(&mut wave, 0.0);
    slew_limit(&mut wave, 0.0);
    normalize(&mut wave, 0.0);
    normalize(&mut wave, NORMALIZE_OFF);
    assert_eq!(wave, reference);

    apply_render_chain(&mut wave, &FxParams::bypass(), &filter, &mut scratch, 22050.0);
    apply_shaping(&mut wave, &FxParams::bypass());
    assert_eq!(wave, reference);
}

#[test]
fn full_normalize_reaches_peak() {
    let mut wave = test_wave();
    normalize(&mut wave, 1.0);
    assert!((peak(&wave) - PEAK_LEVEL).abs() <= 1);
}

#[test]
fn normalize_removes_dc() {
    let mut wave = test_wave();
    normalize(&mut wave, 1.0);
    let sum: i64 = wave.iter().map(|s| *s as i64).sum();
    assert!((sum / WT_TABLE_LEN as i64).abs() <= 3);
}

#[test]
fn low_normalize_attenuates() {
    let mut wave = test_wave();
    remove_dc_offset(&mut wave);
    let before = peak(&wave);
    normalize(&mut wave, 0.25);
    let expected = before as Float * 0.55;
    assert!((peak(&wave) as Float - expected).abs() <= 1.0);
}

#[test]
fn gain_within_one_step_of_unity_is_skipped() {
    let pattern = [32767, 12345, -32767, -12345];
    let reference: Vec<i16> = (0..WT_TABLE_LEN).map(|i| pattern[i % 4]).collect();

    let mut wave = reference.clone();
    normalize(&mut wave, 0.49999); // Gain 0.999982
    assert_eq!(wave, reference);
    normalize(&mut wave, 1.0); // Already at full scale
    assert_eq!(wave, reference);

    normalize(&mut wave, 0.4999); // Gain 0.99982 is applied
    assert_ne!(wave, reference);
    assert!(peak(&wave) < 32767);
}

#[test]
fn dc_removal_does_not_overflow() {
    let mut wave = vec![i16::MIN; 8];
    wave[0] = i16::MAX;
    remove_dc_offset(&mut wave);
    assert_eq!(wave[0], i16::MAX);
    let sum: i64 = wave.iter().map(|s| *s as i64).sum();
    assert!(sum.abs() < (i16::MAX as i64) * 2);
}

#[test]
fn wavefold_keeps_peak_level() {
    let mut wave = test_wave();
    let before = peak(&wave);
    wavefold(&mut wave, 0.8);
    assert_ne!(wave, test_wave());
    assert!((peak(&wave) - before).abs() <= 1);
}

#[test]
fn decimate_holds_samples() {
    let mut wave = test_wave();
    decimate(&mut wave, 1.0);
    for block in wave.chunks(64) {
        assert!(block.iter().all(|s| *s == block[0]));
    }
}

#[test]
fn metalize_changes_wave_and_keeps_peak() {
    let mut wave = test_wave();
    let before = peak(&wave);
    metalize(&mut wave, 0.7);
    assert_ne!(wave, test_wave());
    assert!((peak(&wave) - before).abs() <= 1);
}

#[test]
fn lowpass_cutoff_follows_control() {
    assert!(lowpass_cutoff_ratio(0.0, 22050.0) > 0.95);
    let ratio = lowpass_cutoff_ratio(1.0, 22050.0);
    assert!((ratio - 201.0 / 22050.0).abs() < 0.0001);
}

#[test]
fn distortion_stays_in_range() {
    let mut wave = vec![i16::MIN, -16384, -1, 0, 1, 16384, i16::MAX];
    distort(&mut wave, 1.0);
    assert_eq!(wave[3], 0);
    assert!(wave[5] > 16384); // Soft clipper lifts mid level samples
    assert!(wave[6] > 32000);
    assert!(wave[0] < -32000);
}

#[test]
fn slew_limit_bounds_steps_and_matches_ends() {
    let mut wave: Vec<i16> = (0..WT_TABLE_LEN).map(|i| if (i / 64) % 2 == 0 { 20000 } else { -20000 }).collect();
    slew_limit(&mut wave, 0.5);
    let max_delta = (0.001 as Float).powf(0.5) * 32767.0;
    for pair in wave.windows(2) {
        // The de-trend ramp adds a small constant step on top of the limit
        assert!(((pair[1] as i32 - pair[0] as i32).abs() as Float) <= max_delta + 100.0);
    }
    assert!((wave[WT_TABLE_LEN - 1] as i32 - wave[0] as i32).abs() <= 1);
}
