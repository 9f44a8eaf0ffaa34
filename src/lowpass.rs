//! Spectral lowpass filter for single cycle waveforms.
//!
//! The filter runs a forward FFT over the whole cycle, zeroes all bins above
//! the cutoff and transforms back. Since the waveform is periodic, no
//! windowing is needed.

use super::Float;
use super::wavetable::to_sample;

use log::{debug, warn};
use rustfft::{Fft, FftPlanner};
use rustfft::num_complex::Complex;
use rustfft::num_traits::Zero;

use std::sync::Arc;

pub type Harmonic = Complex<Float>;

/// Block lowpass used by the lowpass effect stage.
///
/// `cutoff_ratio` is the cutoff relative to the Nyquist frequency, in the
/// range [0.0, 1.0]. `scratch` must hold at least as many values as the
/// input.
pub trait LowpassFilter: Sync {
    fn lowpass(&self, input: &[i16], output: &mut [i16], scratch: &mut [Harmonic], cutoff_ratio: Float);
}

/// FFT based implementation of `LowpassFilter`.
pub struct FftLowpass {
    len: usize,
    forward: Arc<dyn Fft<Float>>,
    inverse: Arc<dyn Fft<Float>>,
}

impl FftLowpass {
    /// Plan the transforms for blocks of the given length.
    ///
    /// ```
    /// use wavesphere::{FftLowpass, WT_TABLE_LEN};
    ///
    /// let filter = FftLowpass::new(WT_TABLE_LEN);
    /// ```
    pub fn new(len: usize) -> FftLowpass {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(len);
        let inverse = planner.plan_fft_inverse(len);
        debug!("Planned lowpass FFT for {} samples", len);
        FftLowpass{len, forward, inverse}
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl LowpassFilter for FftLowpass {
    fn lowpass(&self, input: &[i16], output: &mut [i16], scratch: &mut [Harmonic], cutoff_ratio: Float) {
        let len = self.len;
        if input.len() < len || output.len() < len || scratch.len() < len {
            warn!("Lowpass buffers too short for block length {}, copying", len);
            let n = input.len().min(output.len());
            output[..n].copy_from_slice(&input[..n]);
            return;
        }
        let buffer = &mut scratch[..len];
        for (b, s) in buffer.iter_mut().zip(input.iter()) {
            *b = Harmonic::new(*s as Float, 0.0);
        }
        self.forward.process(buffer);

        let ratio = num::clamp(cutoff_ratio, 0.0, 1.0);
        let num_harmonics = (ratio * (len / 2) as Float).round() as usize;
        for (i, b) in buffer.iter_mut().enumerate() {
            if i > num_harmonics && i < len - num_harmonics {
                *b = Harmonic::zero(); // Zero out freq components we don't want
            }
        }
        self.inverse.process(buffer);

        let scale = 1.0 / len as Float;
        for (o, b) in output.iter_mut().zip(buffer.iter()) {
            *o = to_sample(b.re * scale);
        }
    }
}

// ----------------------------------------------
//                  Unit tests
// ----------------------------------------------

#[cfg(test)]
fn sine(len: usize, harmonic: usize, amplitude: Float) -> Vec<Float> {
    let mult = harmonic as Float * 2.0 * std::f64::consts::PI as Float / len as Float;
    (0..len).map(|i| (i as Float * mult).sin() * amplitude).collect()
}

#[test]
fn full_cutoff_keeps_signal() {
    let len = 512;
    let filter = FftLowpass::new(len);
    let input: Vec<i16> = sine(len, 3, 20000.0).iter().zip(sine(len, 100, 5000.0).iter())
        .map(|(a, b)| (a + b).round() as i16).collect();
    let mut output = vec![0i16; len];
    let mut scratch = vec![Harmonic::zero(); len];
    filter.lowpass(&input, &mut output, &mut scratch, 1.0);
    for (a, b) in input.iter().zip(output.iter()) {
        assert!((*a as i32 - *b as i32).abs() <= 1);
    }
}

#[test]
fn high_harmonics_are_removed() {
    let len = 512;
    let filter = FftLowpass::new(len);
    let low = sine(len, 2, 16000.0);
    let input: Vec<i16> = low.iter().zip(sine(len, 120, 8000.0).iter())
        .map(|(a, b)| (a + b).round() as i16).collect();
    let mut output = vec![0i16; len];
    let mut scratch = vec![Harmonic::zero(); len];
    filter.lowpass(&input, &mut output, &mut scratch, 0.1); // Keeps harmonics up to 26
    for (expected, actual) in low.iter().zip(output.iter()) {
        assert!((expected.round() as i32 - *actual as i32).abs() <= 2);
    }
}

#[test]
fn zero_cutoff_keeps_only_dc() {
    let len = 512;
    let filter = FftLowpass::new(len);
    let input: Vec<i16> = sine(len, 1, 10000.0).iter().map(|s| (s + 1000.0).round() as i16).collect();
    let mut output = vec![0i16; len];
    let mut scratch = vec![Harmonic::zero(); len];
    filter.lowpass(&input, &mut output, &mut scratch, 0.0);
    for s in output.iter() {
        assert!((*s as i32 - 1000).abs() <= 1);
    }
}
