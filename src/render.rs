//! Renders the 27 waveforms of a sphere from a recording buffer.
//!
//! Every waveform is cut out of the recording buffer with the resampler,
//! made loopable by crossfading the overlap after its end into its start,
//! and then sent through the fixed effect chain with its own effect
//! parameters. Consecutive waveforms in browse order start `spread`
//! samples apart in the recording buffer.

use super::Float;
use super::effects::{self, FxKind, FxParams, NUM_FX_KINDS};
use super::lowpass::{FftLowpass, Harmonic, LowpassFilter};
use super::resampler::{resample_hermite, ReadPos, ResampleMode, ResamplerState};
use super::settings::Settings;
use super::wavetable::{Coord, Sphere, Waveform, BROWSE_TABLE, NUM_WAVES_PER_SPHERE, WT_TABLE_LEN};

use log::{debug, info, trace, warn};
use scoped_threadpool::Pool;
use serde::{Serialize, Deserialize};

/// Circular buffer holding the source material for rendering.
#[derive(Clone, Debug, PartialEq)]
pub struct RecBuf {
    samples: Vec<i16>,
}

impl RecBuf {
    /// Creates a silent buffer of the given length.
    pub fn new(len: usize) -> RecBuf {
        RecBuf{samples: vec![0; len]}
    }

    pub fn from_samples(samples: Vec<i16>) -> RecBuf {
        RecBuf{samples}
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [i16] {
        &mut self.samples
    }

    /// Copy all waveforms of a sphere into the buffer, in browse order.
    ///
    /// A buffer shorter than the whole sphere wraps around, so later
    /// waveforms overwrite earlier ones.
    pub fn fill_from_sphere(&mut self, sphere: &Sphere) {
        let len = self.samples.len();
        if len == 0 {
            warn!("Not copying sphere into empty recording buffer");
            return;
        }
        for (i, coord) in BROWSE_TABLE.iter().enumerate() {
            let wave = sphere.wave(*coord);
            for (j, s) in wave.samples.iter().enumerate() {
                self.samples[(i * WT_TABLE_LEN + j) % len] = *s;
            }
        }
        debug!("Copied sphere into recording buffer of {} samples", len);
    }
}

/// Controls for cutting waveforms out of the recording buffer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenderParams {
    pub read_pos: usize,  // Start of the first waveform in browse order
    pub stretch: Float,   // Source samples per output sample
    pub spread: usize,    // Distance between consecutive start positions
    pub smoothing: Float, // 0.0 - 1.0, length of the loop crossfade
}

impl Default for RenderParams {
    fn default() -> Self {
        RenderParams{read_pos: 0, stretch: 1.0, spread: WT_TABLE_LEN, smoothing: 0.0}
    }
}

/// Number of extra samples rendered for the loop crossfade.
pub fn smoothing_overlap(smoothing: Float) -> usize {
    (num::clamp(smoothing, 0.0, 1.0) * (WT_TABLE_LEN / 2) as Float).round() as usize
}

/// The sphere currently being edited.
pub struct SphereBuf {
    pub sphere: Sphere,
    pub params: RenderParams,
    fx: [[Float; NUM_WAVES_PER_SPHERE]; NUM_FX_KINDS],
    start_pos: [usize; NUM_WAVES_PER_SPHERE],
}

impl Default for SphereBuf {
    fn default() -> Self {
        SphereBuf::new()
    }
}

impl SphereBuf {
    /// Creates a silent sphere with default effect parameters.
    pub fn new() -> SphereBuf {
        let defaults = FxParams::default();
        let mut fx = [[0.0; NUM_WAVES_PER_SPHERE]; NUM_FX_KINDS];
        for kind in FxKind::ALL.iter() {
            fx[kind.index()] = [defaults.get(*kind); NUM_WAVES_PER_SPHERE];
        }
        SphereBuf{
            sphere: Sphere::new(),
            params: RenderParams::default(),
            fx,
            start_pos: [0; NUM_WAVES_PER_SPHERE],
        }
    }

    /// Replace the waveforms, keeping effect and render parameters.
    pub fn load_sphere(&mut self, sphere: &Sphere) {
        self.sphere = sphere.clone();
    }

    pub fn to_sphere(&self) -> Sphere {
        self.sphere.clone()
    }

    pub fn wave(&self, coord: Coord) -> &Waveform {
        self.sphere.wave(coord)
    }

    pub fn fx(&self, kind: FxKind, coord: Coord) -> Float {
        self.fx[kind.index()][coord.index()]
    }

    /// Set one effect control of one waveform, clamped to [0.0, 1.0].
    pub fn set_fx(&mut self, kind: FxKind, coord: Coord, value: Float) {
        self.fx[kind.index()][coord.index()] = num::clamp(value, 0.0, 1.0);
    }

    /// Set one effect control for all waveforms.
    pub fn set_fx_all(&mut self, kind: FxKind, value: Float) {
        self.fx[kind.index()] = [num::clamp(value, 0.0, 1.0); NUM_WAVES_PER_SPHERE];
    }

    /// All effect controls of one waveform.
    pub fn fx_params(&self, coord: Coord) -> FxParams {
        let mut params = FxParams::default();
        for kind in FxKind::ALL.iter() {
            params.values[kind.index()] = self.fx(*kind, coord);
        }
        params
    }

    /// Recording buffer offset the waveform was rendered from.
    pub fn start_pos(&self, coord: Coord) -> usize {
        self.start_pos[coord.index()]
    }

    /// Apply distortion and slew limiting to a rendered waveform.
    pub fn apply_shaping(&mut self, coord: Coord) {
        let params = self.fx_params(coord);
        trace!("Shaping waveform {:?}", coord);
        effects::apply_shaping(&mut self.sphere.wave_mut(coord).samples, &params);
    }
}

/// Crossfade the tail of an oversized run into its head.
///
/// The samples after the first `output.len()` samples of `input` are blended
/// into the start of the output with a linear ramp, so that the end of the
/// output continues seamlessly into its start. Inputs that aren't longer
/// than the output are copied and padded with silence.
///
/// ```
/// use wavesphere::overlap_smooth;
///
/// let input = [0, 10, 20, 30, 40, 50];
/// let mut output = [0i16; 4];
/// overlap_smooth(&input, &mut output);
/// assert_eq!(output, [40, 30, 20, 30]);
/// ```
pub fn overlap_smooth(input: &[i16], output: &mut [i16]) {
    let len = output.len();
    if input.len() <= len {
        output[..input.len()].copy_from_slice(input);
        for s in output[input.len()..].iter_mut() {
            *s = 0;
        }
        return;
    }
    let overlap = input.len() - len;
    let (head, tail) = input.split_at(len);
    for (i, out) in output.iter_mut().enumerate() {
        *out = if i < overlap {
            let t = tail[i] as i32 * (overlap - i) as i32;
            let h = head[i] as i32 * i as i32;
            ((t + h) / overlap as i32) as i16
        } else {
            head[i]
        };
    }
}

/// Cut one waveform out of the recording buffer.
///
/// Returns the start position of the next waveform.
pub fn put_waveform_in_sphere(recbuf: &RecBuf,
                              start: usize,
                              params: &RenderParams,
                              state: &mut ResamplerState,
                              wave: &mut [i16]) -> usize {
    if recbuf.is_empty() {
        warn!("Rendering from empty recording buffer");
        for s in wave.iter_mut() {
            *s = 0;
        }
        return 0;
    }
    let overlap = smoothing_overlap(params.smoothing);
    let mut run = vec![0i16; wave.len() + overlap];
    resample_hermite(recbuf.samples(),
                     ReadPos::new(start, 0.0),
                     params.stretch,
                     &mut run,
                     state,
                     ResampleMode::Restart);
    overlap_smooth(&run, wave);
    (start + params.spread) % recbuf.len()
}

/// Cut one waveform out of the recording buffer and apply the effect chain.
///
/// Returns the start position of the next waveform.
#[allow(clippy::too_many_arguments)]
pub fn render_one_waveform(recbuf: &RecBuf,
                           start: usize,
                           params: &RenderParams,
                           fx: &FxParams,
                           filter: &dyn LowpassFilter,
                           nyquist_hz: Float,
                           state: &mut ResamplerState,
                           wave: &mut [i16]) -> usize {
    let next = put_waveform_in_sphere(recbuf, start, params, state, wave);
    let mut scratch = vec![Harmonic::new(0.0, 0.0); wave.len()];
    effects::apply_render_chain(wave, fx, filter, &mut scratch, nyquist_hz);
    next
}

/// Renders complete spheres on a thread pool.
pub struct SphereRenderer {
    pool: Pool,
    lowpass: FftLowpass,
    nyquist_hz: Float,
}

impl SphereRenderer {
    pub fn new(num_threads: u32, nyquist_hz: Float) -> SphereRenderer {
        let num_threads = num_threads.max(1);
        debug!("Creating sphere renderer with {} threads", num_threads);
        SphereRenderer{
            pool: Pool::new(num_threads),
            lowpass: FftLowpass::new(WT_TABLE_LEN),
            nyquist_hz,
        }
    }

    pub fn from_settings(settings: &Settings) -> SphereRenderer {
        SphereRenderer::new(settings.render_threads, settings.lowpass_nyquist_hz as Float)
    }

    /// Render all waveforms of the sphere buffer.
    ///
    /// Start positions are assigned in browse order first, after which the
    /// waveforms are rendered independently of each other. The result does
    /// not depend on the number of threads.
    pub fn render_full_sphere(&mut self, recbuf: &RecBuf, buf: &mut SphereBuf) {
        let params = buf.params;
        let mut start = if recbuf.is_empty() { 0 } else { params.read_pos % recbuf.len() };
        for coord in BROWSE_TABLE.iter() {
            buf.start_pos[coord.index()] = start;
            start = if recbuf.is_empty() { 0 } else { (start + params.spread) % recbuf.len() };
        }

        let mut fx = [FxParams::default(); NUM_WAVES_PER_SPHERE];
        for (i, p) in fx.iter_mut().enumerate() {
            *p = buf.fx_params(Coord::from_index(i));
        }
        let start_pos = buf.start_pos;
        let lowpass = &self.lowpass;
        let nyquist_hz = self.nyquist_hz;

        self.pool.scoped(|scope| {
            for (i, wave) in buf.sphere.waves.iter_mut().enumerate() {
                let fx = fx[i];
                let start = start_pos[i];
                scope.execute(move || {
                    let mut state = ResamplerState::new();
                    render_one_waveform(recbuf, start, &params, &fx, lowpass, nyquist_hz, &mut state, &mut wave.samples);
                });
            }
        });
        info!("Rendered sphere from {} samples, start {}, stretch {}, spread {}",
              recbuf.len(), params.read_pos, params.stretch, params.spread);
    }
}

// ----------------------------------------------
//                  Unit tests
// ----------------------------------------------

#[cfg(test)]
fn test_recbuf(len: usize) -> RecBuf {
    RecBuf::from_samples((0..len).map(|i| ((i * 7919) % 30011) as i16 - 15000).collect())
}

#[cfg(test)]
fn test_sphere() -> Sphere {
    let mut sphere = Sphere::new();
    for (i, wave) in sphere.waves.iter_mut().enumerate() {
        for (j, s) in wave.samples.iter_mut().enumerate() {
            *s = (i * 1000 + j) as i16;
        }
    }
    sphere
}

#[test]
fn short_input_is_padded() {
    let mut output = [7i16; 5];
    overlap_smooth(&[1, 2, 3], &mut output);
    assert_eq!(output, [1, 2, 3, 0, 0]);
    let mut output = [7i16; 3];
    overlap_smooth(&[1, 2, 3], &mut output);
    assert_eq!(output, [1, 2, 3]);
}

#[test]
fn overlap_ramp_joins_end_to_start() {
    let input: Vec<i16> = (0..(WT_TABLE_LEN + 64)).map(|i| (i * 10) as i16).collect();
    let mut output = vec![0i16; WT_TABLE_LEN];
    overlap_smooth(&input, &mut output);
    assert_eq!(output[0], input[WT_TABLE_LEN]); // Continues after the last sample
    assert_eq!(&output[64..], &input[64..WT_TABLE_LEN]);
    for i in 1..64 {
        assert!(output[i] <= output[i - 1]); // Ramps from tail down to head
    }
}

#[test]
fn next_start_wraps_around() {
    let recbuf = test_recbuf(1000);
    let params = RenderParams{read_pos: 0, stretch: 1.0, spread: 300, smoothing: 0.5};
    let mut state = ResamplerState::new();
    let mut wave = [0i16; WT_TABLE_LEN];
    assert_eq!(put_waveform_in_sphere(&recbuf, 900, &params, &mut state, &mut wave), 200);
}

#[test]
fn unstretched_wave_is_copied() {
    let recbuf = test_recbuf(4096);
    let params = RenderParams::default();
    let mut state = ResamplerState::new();
    let mut wave = [0i16; WT_TABLE_LEN];
    put_waveform_in_sphere(&recbuf, 100, &params, &mut state, &mut wave);
    assert_eq!(&wave[..], &recbuf.samples()[100..100 + WT_TABLE_LEN]);
}

#[test]
fn sphere_fills_recbuf_in_browse_order() {
    let sphere = test_sphere();
    let mut recbuf = RecBuf::new(NUM_WAVES_PER_SPHERE * WT_TABLE_LEN);
    recbuf.fill_from_sphere(&sphere);
    for (i, coord) in BROWSE_TABLE.iter().enumerate() {
        let offset = i * WT_TABLE_LEN;
        assert_eq!(&recbuf.samples()[offset..offset + WT_TABLE_LEN], &sphere.wave(*coord).samples[..]);
    }
}

#[test]
fn bypassed_render_reproduces_source_sphere() {
    let sphere = test_sphere();
    let mut recbuf = RecBuf::new(NUM_WAVES_PER_SPHERE * WT_TABLE_LEN);
    recbuf.fill_from_sphere(&sphere);
    let mut buf = SphereBuf::new();
    buf.set_fx_all(FxKind::Normalize, 0.5);
    let mut renderer = SphereRenderer::new(2, 22050.0);
    renderer.render_full_sphere(&recbuf, &mut buf);
    assert_eq!(buf.to_sphere(), sphere);
}

#[test]
fn start_positions_follow_spread() {
    let ramp: Vec<i16> = (0..4096).map(|i| (i * 16 - 32768) as i16).collect();
    let recbuf = RecBuf::from_samples(ramp);
    let mut buf = SphereBuf::new();
    buf.params = RenderParams{read_pos: 0, stretch: 1.0, spread: 512, smoothing: 0.0};
    let mut renderer = SphereRenderer::new(1, 22050.0);
    renderer.render_full_sphere(&recbuf, &mut buf);
    for (i, coord) in BROWSE_TABLE.iter().enumerate() {
        assert_eq!(buf.start_pos(*coord), (i * 512) % 4096);
    }
}

#[test]
fn render_is_deterministic() {
    let recbuf = test_recbuf(20000);
    let mut buf = SphereBuf::new();
    buf.params = RenderParams{read_pos: 123, stretch: 1.37, spread: 700, smoothing: 0.3};
    for (i, coord) in BROWSE_TABLE.iter().enumerate() {
        let amount = i as Float / NUM_WAVES_PER_SPHERE as Float;
        buf.set_fx(FxKind::Wavefold, *coord, amount);
        buf.set_fx(FxKind::Decimate, *coord, 1.0 - amount);
        buf.set_fx(FxKind::Metalize, *coord, amount * 0.5);
        buf.set_fx(FxKind::Lowpass, *coord, amount);
    }
    let mut renderer = SphereRenderer::new(1, 22050.0);
    renderer.render_full_sphere(&recbuf, &mut buf);
    let first = buf.to_sphere();
    renderer.render_full_sphere(&recbuf, &mut buf);
    assert_eq!(buf.to_sphere(), first);

    let mut renderer = SphereRenderer::new(4, 22050.0);
    renderer.render_full_sphere(&recbuf, &mut buf);
    assert_eq!(buf.to_sphere(), first);
}

#[test]
fn fx_values_are_per_waveform() {
    let mut buf = SphereBuf::new();
    let a = Coord::new(0, 1, 2);
    let b = Coord::new(2, 1, 0);
    buf.set_fx(FxKind::Distort, a, 3.0);
    assert_eq!(buf.fx(FxKind::Distort, a), 1.0);
    assert_eq!(buf.fx(FxKind::Distort, b), 0.0);
    assert_eq!(buf.fx_params(b), FxParams::default());
}

#[test]
fn shaping_only_touches_one_waveform() {
    let mut buf = SphereBuf::new();
    buf.load_sphere(&test_sphere());
    let a = Coord::new(1, 1, 1);
    buf.set_fx(FxKind::Distort, a, 1.0);
    buf.set_fx_all(FxKind::SlewLimit, 0.0);
    buf.apply_shaping(a);
    buf.apply_shaping(Coord::new(0, 0, 0));
    let reference = test_sphere();
    assert_ne!(buf.wave(a), reference.wave(a));
    for i in 0..NUM_WAVES_PER_SPHERE {
        if i != a.index() {
            assert_eq!(buf.sphere.waves[i], reference.waves[i]);
        }
    }
}
