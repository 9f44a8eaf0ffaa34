//! 4-point Hermite resampler over a circular source buffer.
//!
//! The resampler keeps its sample window and fractional read offset in a
//! `ResamplerState` owned by the caller. Passing `ResampleMode::Continue`
//! resumes exactly where the previous call stopped, so a run split over
//! several calls produces the same samples as a single long call.

use super::Float;
use super::wavetable::to_sample;

use log::{trace, warn};

/// Whether to prime the sample window from the start position or resume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResampleMode {
    Restart,
    Continue,
}

/// Absolute read position in a source buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ReadPos {
    pub index: usize,
    pub frac: Float,
}

impl ReadPos {
    pub fn new(index: usize, frac: Float) -> ReadPos {
        ReadPos{index, frac}
    }
}

/// Window and read offset carried between calls.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ResamplerState {
    xm1: Float,
    x0: Float,
    x1: Float,
    x2: Float,
    frac: Float,
    pos: usize, // Source index of x0
    primed: bool,
}

impl ResamplerState {
    pub fn new() -> ResamplerState {
        ResamplerState::default()
    }

    /// Current read position, pointing at the next output sample.
    pub fn read_pos(&self) -> ReadPos {
        ReadPos{index: self.pos, frac: self.frac}
    }

    // Load the window around the given position.
    fn prime(&mut self, src: &[i16], index: usize, frac: Float) {
        let len = src.len();
        let index = index % len;
        self.xm1 = src[(index + len - 1) % len] as Float;
        self.x0 = src[index] as Float;
        self.x1 = src[(index + 1) % len] as Float;
        self.x2 = src[(index + 2) % len] as Float;
        self.pos = index;
        self.frac = frac;
        self.primed = true;
    }

    // Move the window forward by one source sample.
    fn shift(&mut self, src: &[i16]) {
        let len = src.len();
        self.pos = (self.pos + 1) % len;
        self.xm1 = self.x0;
        self.x0 = self.x1;
        self.x1 = self.x2;
        self.x2 = src[(self.pos + 2) % len] as Float;
    }

    // Move the window forward by a whole number of source samples.
    //
    // Small steps shift the window, larger ones reload it. Both end up with
    // identical window contents.
    fn advance(&mut self, src: &[i16], steps: usize) {
        if steps >= 4 {
            let frac = self.frac;
            let index = self.pos + steps;
            self.prime(src, index, frac);
        } else {
            for _ in 0..steps {
                self.shift(src);
            }
        }
    }

    fn interpolate(&self) -> Float {
        let c = (self.x1 - self.xm1) * 0.5;
        let v = self.x0 - self.x1;
        let w = c + v;
        let a = w + v + (self.x2 - self.x0) * 0.5;
        let b_neg = w + a;
        let f = self.frac;
        (((a * f) - b_neg) * f + c) * f + self.x0
    }
}

/// Resample a circular source buffer into `out`.
///
/// The source is read starting at `start` (only used when restarting) with
/// `rate` source samples per output sample. A rate of exactly 1.0 copies the
/// source samples without interpolation. Returns the read position of the
/// next output sample.
///
/// ```
/// use wavesphere::{resample_hermite, ReadPos, ResampleMode, ResamplerState};
///
/// let src: Vec<i16> = (0..64).map(|i| i * 100).collect();
/// let mut out = [0i16; 8];
/// let mut state = ResamplerState::new();
/// resample_hermite(&src, ReadPos::new(4, 0.0), 0.5, &mut out, &mut state, ResampleMode::Restart);
/// assert_eq!(out[1], 450);
/// ```
pub fn resample_hermite(src: &[i16],
                        start: ReadPos,
                        rate: Float,
                        out: &mut [i16],
                        state: &mut ResamplerState,
                        mode: ResampleMode) -> ReadPos {
    if src.is_empty() {
        warn!("Resampling from empty source, writing silence");
        for sample in out.iter_mut() {
            *sample = 0;
        }
        return start;
    }
    if mode == ResampleMode::Restart || !state.primed {
        state.prime(src, start.index, start.frac);
    }
    let rate = if !rate.is_finite() || rate < 0.0 { 0.0 } else { rate };
    trace!("Resampling {} samples at rate {} from {}", out.len(), rate, state.pos);

    if rate == 1.0 {
        let len = src.len();
        let mut index = state.pos;
        for sample in out.iter_mut() {
            *sample = src[index];
            index = (index + 1) % len;
        }
        let frac = state.frac;
        state.prime(src, index, frac);
        return state.read_pos();
    }

    for sample in out.iter_mut() {
        *sample = to_sample(state.interpolate());
        state.frac += rate;
        if state.frac >= 1.0 {
            let steps = state.frac.floor();
            state.frac -= steps;
            state.advance(src, (steps % src.len() as Float) as usize);
        }
    }
    state.read_pos()
}

/// Plays a source buffer at an arbitrary pitch, one block at a time.
pub struct PitchedVoice {
    state: ResamplerState,
    start: ReadPos,
    restart: bool,
}

impl PitchedVoice {
    pub fn new(start: ReadPos) -> PitchedVoice {
        PitchedVoice{state: ResamplerState::new(), start, restart: true}
    }

    /// Jump back to the given position with the next block.
    pub fn retrigger(&mut self, start: ReadPos) {
        self.start = start;
        self.restart = true;
    }

    /// Render the next block of the voice.
    pub fn render(&mut self, src: &[i16], rate: Float, out: &mut [i16]) -> ReadPos {
        let mode = if self.restart { ResampleMode::Restart } else { ResampleMode::Continue };
        self.restart = false;
        resample_hermite(src, self.start, rate, out, &mut self.state, mode)
    }
}

// ----------------------------------------------
//                  Unit tests
// ----------------------------------------------

#[cfg(test)]
fn test_source(len: usize) -> Vec<i16> {
    (0..len).map(|i| ((i * 7919) % 20011) as i16 - 10000).collect()
}

#[test]
fn unity_rate_copies_source() {
    let src = test_source(300);
    let mut out = vec![0i16; 300];
    let mut state = ResamplerState::new();
    let end = resample_hermite(&src, ReadPos::new(0, 0.0), 1.0, &mut out, &mut state, ResampleMode::Restart);
    assert_eq!(out, src);
    assert_eq!(end.index, 0); // Wrapped around exactly once
}

#[test]
fn unity_rate_wraps_around() {
    let src = test_source(10);
    let mut out = vec![0i16; 4];
    let mut state = ResamplerState::new();
    let end = resample_hermite(&src, ReadPos::new(8, 0.0), 1.0, &mut out, &mut state, ResampleMode::Restart);
    assert_eq!(out, vec![src[8], src[9], src[0], src[1]]);
    assert_eq!(end, ReadPos::new(2, 0.0));
}

#[test]
fn continued_runs_match_single_run() {
    let src = test_source(1000);
    for rate in [0.37, 0.999, 1.5, 2.0, 3.25, 4.75, 9.1].iter() {
        let n = 200;
        let start = ReadPos::new(17, 0.25);

        let mut single = vec![0i16; 2 * n];
        let mut state = ResamplerState::new();
        let end_single = resample_hermite(&src, start, *rate, &mut single, &mut state, ResampleMode::Restart);

        let mut split = vec![0i16; 2 * n];
        let mut state = ResamplerState::new();
        resample_hermite(&src, start, *rate, &mut split[..n], &mut state, ResampleMode::Restart);
        let end_split = resample_hermite(&src, ReadPos::default(), *rate, &mut split[n..], &mut state, ResampleMode::Continue);

        assert_eq!(single, split, "rate {}", rate);
        assert_eq!(end_single, end_split);
    }
}

#[test]
fn linear_ramp_is_reproduced() {
    let src: Vec<i16> = (0..256).map(|i| i * 10).collect();
    let mut out = vec![0i16; 8];
    let mut state = ResamplerState::new();
    let end = resample_hermite(&src, ReadPos::new(10, 0.0), 0.5, &mut out, &mut state, ResampleMode::Restart);
    assert_eq!(out, vec![100, 105, 110, 115, 120, 125, 130, 135]);
    assert_eq!(end, ReadPos::new(14, 0.0));
}

#[test]
fn output_is_clamped() {
    let src = vec![-32768, 32767, 32767, -32768, -32768, 32767, 32767, -32768];
    let mut out = vec![0i16; 64];
    let mut state = ResamplerState::new();
    resample_hermite(&src, ReadPos::new(0, 0.0), 0.125, &mut out, &mut state, ResampleMode::Restart);
    assert!(out.iter().any(|s| *s == i16::MAX));
    assert!(out.iter().any(|s| *s == i16::MIN));
}

#[test]
fn empty_source_gives_silence() {
    let mut out = vec![5i16; 16];
    let mut state = ResamplerState::new();
    resample_hermite(&[], ReadPos::new(3, 0.5), 0.7, &mut out, &mut state, ResampleMode::Restart);
    assert!(out.iter().all(|s| *s == 0));
}

#[test]
fn large_steps_match_small_steps() {
    // Rate 4.0 takes the reload path, 2.0 twice the shift path.
    let src = test_source(500);
    let mut fast = vec![0i16; 50];
    let mut state = ResamplerState::new();
    resample_hermite(&src, ReadPos::new(3, 0.5), 4.0, &mut fast, &mut state, ResampleMode::Restart);

    let mut slow = vec![0i16; 100];
    let mut state = ResamplerState::new();
    resample_hermite(&src, ReadPos::new(3, 0.5), 2.0, &mut slow, &mut state, ResampleMode::Restart);
    let every_other: Vec<i16> = slow.iter().step_by(2).cloned().collect();
    assert_eq!(fast, every_other);
}

#[test]
fn invalid_rates_do_not_run_away() {
    let src = test_source(300);
    for rate in [Float::NAN, Float::INFINITY, -2.0].iter() {
        let mut out = vec![0i16; 16];
        let mut state = ResamplerState::new();
        let end = resample_hermite(&src, ReadPos::new(7, 0.0), *rate, &mut out, &mut state, ResampleMode::Restart);
        assert!(out.iter().all(|s| *s == src[7]));
        assert_eq!(end, ReadPos::new(7, 0.0));
    }

    // Huge rates wrap around the source instead of overflowing
    let mut out = vec![0i16; 16];
    let mut state = ResamplerState::new();
    let end = resample_hermite(&src, ReadPos::new(7, 0.0), 1e30, &mut out, &mut state, ResampleMode::Restart);
    assert!(end.index < src.len());
    assert!(end.frac >= 0.0 && end.frac < 1.0);
}

#[test]
fn pitched_voice_resumes_between_blocks() {
    let src = test_source(2048);
    let start = ReadPos::new(100, 0.0);
    let mut voice = PitchedVoice::new(start);
    let mut blocks = vec![0i16; 256];
    for block in blocks.chunks_mut(32) {
        voice.render(&src, 1.3, block);
    }

    let mut whole = vec![0i16; 256];
    let mut state = ResamplerState::new();
    resample_hermite(&src, start, 1.3, &mut whole, &mut state, ResampleMode::Restart);
    assert_eq!(blocks, whole);

    voice.retrigger(start);
    let mut again = vec![0i16; 32];
    voice.render(&src, 1.3, &mut again);
    assert_eq!(&again[..], &whole[..32]);
}
