//! Wavetable oscillator playing a position inside a sphere.
//!
//! The oscillator holds two pairs of waveforms (ping-pong slots). The pair
//! in the active slot is played, the other slot is filled by the loader
//! when the position moves to a different pair of grid corners. When a load
//! is committed, the oscillator crossfades from the old pair to the new one
//! instead of jumping.
//!
//! Within a pair, the lower corner is the floor of the position on every
//! axis. The upper corner is its neighbour along the axis with the largest
//! fraction, and the two are mixed by that fraction. The output reaches the
//! next grid waveform exactly when the position reaches it. The fraction is
//! calculated from the current position for every sample, so small
//! movements don't need a reload.

use super::Float;
use super::settings::Settings;
use super::wavetable::{Coord, WT_DIM_SIZE, WT_TABLE_LEN};

use log::{debug, info};

const MAX_POS: Float = (WT_DIM_SIZE - 1) as Float;
const SAMPLE_SCALE: Float = 1.0 / 32768.0;

/// Pending reload of the oscillator's waveforms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReloadRequest {
    None,
    Refresh, // Reload if the corners changed since the last load
    Force,   // Reload unconditionally
}

pub struct WtOsc {
    pub sample_rate: Float,
    tables: [[[i16; WT_TABLE_LEN]; 2]; 2], // [slot][lower, upper corner]
    corners: [[Coord; 2]; 2],
    active: usize,
    has_table: bool,
    request: ReloadRequest,
    crossfade_len: usize,
    crossfade_pos: usize,
    pos: [Float; 3],
    phase_int: usize,
    phase_frac: Float,
}

impl WtOsc {

    /// Create a new oscillator, silent until the first load is committed.
    ///
    /// ```
    /// use wavesphere::{ReloadRequest, WtOsc};
    ///
    /// let mut osc = WtOsc::new(48000.0, 64);
    /// assert_eq!(osc.request(), ReloadRequest::Force);
    /// assert_eq!(osc.get_sample(440.0), 0.0);
    /// ```
    pub fn new(sample_rate: Float, crossfade_len: usize) -> WtOsc {
        let origin = Coord::new(0, 0, 0);
        WtOsc{
            sample_rate,
            tables: [[[0; WT_TABLE_LEN]; 2]; 2],
            corners: [[origin; 2]; 2],
            active: 0,
            has_table: false,
            request: ReloadRequest::Force,
            crossfade_len,
            crossfade_pos: crossfade_len,
            pos: [0.0; 3],
            phase_int: 0,
            phase_frac: 0.0,
        }
    }

    pub fn from_settings(settings: &Settings) -> WtOsc {
        WtOsc::new(settings.sample_rate as Float, settings.crossfade_samples)
    }

    // ------------------
    // Position
    // ------------------

    /// Move to a new position. Every axis is clamped to [0.0, 2.0].
    pub fn set_position(&mut self, x: Float, y: Float, z: Float) {
        self.pos = [num::clamp(x, 0.0, MAX_POS),
                    num::clamp(y, 0.0, MAX_POS),
                    num::clamp(z, 0.0, MAX_POS)];
        if self.request == ReloadRequest::None {
            self.request = ReloadRequest::Refresh;
        }
    }

    pub fn position(&self) -> [Float; 3] {
        self.pos
    }

    // Lower grid index of an axis, leaving room for the upper corner.
    fn lower_index(pos: Float) -> usize {
        (pos.floor() as usize).min(WT_DIM_SIZE - 2)
    }

    /// Lower and upper corner for the current position.
    ///
    /// ```
    /// use wavesphere::{Coord, WtOsc};
    ///
    /// let mut osc = WtOsc::new(48000.0, 64);
    /// osc.set_position(0.2, 1.7, 0.4);
    /// assert_eq!(osc.target_corners(), [Coord::new(0, 1, 0), Coord::new(0, 2, 0)]);
    /// ```
    pub fn target_corners(&self) -> [Coord; 2] {
        let mut lower = [0; 3];
        let mut axis = 0;
        let mut largest = 0.0;
        for a in 0..3 {
            lower[a] = WtOsc::lower_index(self.pos[a]);
            let frac = self.pos[a] - lower[a] as Float;
            if frac > largest {
                largest = frac;
                axis = a;
            }
        }
        let mut upper = lower;
        upper[axis] += 1;
        [Coord::new(lower[0], lower[1], lower[2]), Coord::new(upper[0], upper[1], upper[2])]
    }

    // Mix of the upper corner for the given corner pair.
    fn blend_weight(&self, corners: &[Coord; 2]) -> Float {
        let lower = [corners[0].x, corners[0].y, corners[0].z];
        let upper = [corners[1].x, corners[1].y, corners[1].z];
        match (0..3).find(|a| upper[*a] != lower[*a]) {
            Some(a) => num::clamp(self.pos[a] - lower[a] as Float, 0.0, 1.0),
            None => 0.0,
        }
    }

    // ------------------
    // Loading
    // ------------------

    pub fn request(&self) -> ReloadRequest {
        self.request
    }

    /// Reload if the position moved to different corners.
    pub fn request_refresh(&mut self) {
        if self.request == ReloadRequest::None {
            self.request = ReloadRequest::Refresh;
        }
    }

    /// Reload unconditionally, e.g. after the sphere was edited.
    pub fn request_force(&mut self) {
        self.request = ReloadRequest::Force;
    }

    /// Consume the pending request.
    ///
    /// Returns the corners to load, or None if nothing needs to be loaded.
    pub fn take_request(&mut self) -> Option<[Coord; 2]> {
        let request = self.request;
        self.request = ReloadRequest::None;
        let target = self.target_corners();
        match request {
            ReloadRequest::None => None,
            ReloadRequest::Refresh if self.has_table && target == self.corners[self.active] => None,
            _ => Some(target),
        }
    }

    /// True while switching from the old to the new table pair.
    pub fn is_crossfading(&self) -> bool {
        self.crossfade_pos < self.crossfade_len
    }

    /// Buffers of the slot that isn't playing.
    ///
    /// Must not be filled while crossfading, since the old tables are still
    /// audible.
    pub fn inactive_tables_mut(&mut self) -> &mut [[i16; WT_TABLE_LEN]; 2] {
        &mut self.tables[self.active ^ 1]
    }

    /// Switch to the freshly filled inactive slot.
    pub fn commit_load(&mut self, corners: [Coord; 2]) {
        let slot = self.active ^ 1;
        self.corners[slot] = corners;
        self.active = slot;
        self.crossfade_pos = 0;
        self.has_table = true;
        debug!("Switched to tables {:?} - {:?}", corners[0], corners[1]);
    }

    pub fn active_corners(&self) -> Option<[Coord; 2]> {
        if self.has_table {
            Some(self.corners[self.active])
        } else {
            None
        }
    }

    // ------------------
    // Playback
    // ------------------

    // Value of one slot at the current phase.
    fn slot_sample(&self, slot: usize) -> Float {
        let i0 = self.phase_int;
        let i1 = (i0 + 1) % WT_TABLE_LEN;
        let tables = &self.tables[slot];
        let lower = tables[0][i0] as Float + (tables[0][i1] as Float - tables[0][i0] as Float) * self.phase_frac;
        let upper = tables[1][i0] as Float + (tables[1][i1] as Float - tables[1][i0] as Float) * self.phase_frac;
        let weight = self.blend_weight(&self.corners[slot]);
        lower + (upper - lower) * weight
    }

    /// Get the next sample for the given frequency in Hz.
    ///
    /// The result is in the range [-1.0, 1.0].
    pub fn get_sample(&mut self, frequency: Float) -> Float {
        let mut result = self.slot_sample(self.active);
        if self.is_crossfading() {
            let amount = self.crossfade_pos as Float / self.crossfade_len as Float;
            let old = self.slot_sample(self.active ^ 1);
            result = old + (result - old) * amount;
            self.crossfade_pos += 1;
        }

        let mut step = frequency * WT_TABLE_LEN as Float / self.sample_rate;
        if !step.is_finite() || step < 0.0 {
            step = 0.0;
        }
        self.phase_frac += step;
        if self.phase_frac >= 1.0 {
            let whole = self.phase_frac.floor();
            self.phase_frac -= whole;
            let wrapped = (whole % WT_TABLE_LEN as Float) as usize;
            self.phase_int = (self.phase_int + wrapped) % WT_TABLE_LEN;
        }
        result * SAMPLE_SCALE
    }

    /// Fill a block of samples.
    pub fn render_block(&mut self, frequency: Float, out: &mut [Float]) {
        for sample in out.iter_mut() {
            *sample = self.get_sample(frequency);
        }
    }

    /// Restart the waveform cycle.
    pub fn reset(&mut self) {
        info!("Resetting oscillator phase");
        self.phase_int = 0;
        self.phase_frac = 0.0;
    }
}

// ----------------------------------------------
//                  Unit tests
// ----------------------------------------------

#[cfg(test)]
fn load_constant(osc: &mut WtOsc, lower: i16, upper: i16) {
    let corners = osc.take_request().unwrap_or(osc.target_corners());
    let tables = osc.inactive_tables_mut();
    tables[0] = [lower; WT_TABLE_LEN];
    tables[1] = [upper; WT_TABLE_LEN];
    osc.commit_load(corners);
}

#[cfg(test)]
fn skip_crossfade(osc: &mut WtOsc) {
    while osc.is_crossfading() {
        osc.get_sample(0.0);
    }
}

#[test]
fn silent_until_loaded() {
    let mut osc = WtOsc::new(48000.0, 16);
    let mut out = [1.0; 32];
    osc.render_block(440.0, &mut out);
    assert!(out.iter().all(|s| *s == 0.0));
    assert_eq!(osc.active_corners(), None);
}

#[test]
fn position_is_clamped_not_wrapped() {
    let mut osc = WtOsc::new(48000.0, 16);
    osc.set_position(-1.0, 5.0, 1.5);
    assert_eq!(osc.position(), [0.0, 2.0, 1.5]);
    // Y sits on the last grid point, which is the upper end of its pair
    assert_eq!(osc.target_corners(), [Coord::new(0, 1, 1), Coord::new(0, 2, 1)]);
}

#[cfg(test)]
// Level of every grid waveform is its raster index times 1000.
fn load_raster_levels(osc: &mut WtOsc) {
    let corners = osc.take_request().unwrap_or(osc.target_corners());
    let tables = osc.inactive_tables_mut();
    for (table, coord) in tables.iter_mut().zip(corners.iter()) {
        *table = [(coord.index() * 1000) as i16; WT_TABLE_LEN];
    }
    osc.commit_load(corners);
}

#[test]
fn upper_corner_is_the_neighbour_on_the_main_axis() {
    let mut osc = WtOsc::new(48000.0, 0);
    osc.set_position(0.5, 0.0, 0.0);
    assert_eq!(osc.target_corners(), [Coord::new(0, 0, 0), Coord::new(1, 0, 0)]);
    osc.set_position(1.2, 0.6, 1.0);
    assert_eq!(osc.target_corners(), [Coord::new(1, 0, 1), Coord::new(1, 1, 1)]);
    osc.set_position(1.0, 1.0, 1.0);
    assert_eq!(osc.target_corners(), [Coord::new(1, 1, 1), Coord::new(2, 1, 1)]);

    osc.set_position(0.0, 0.0, 0.0);
    load_constant(&mut osc, 16384, -16384);
    assert_eq!(osc.get_sample(0.0), 0.5);
    osc.set_position(0.75, 0.0, 0.0); // Weight 0.75
    assert!((osc.get_sample(0.0) + 0.25).abs() < 0.0001);
    osc.set_position(0.75, 0.5, 0.5); // Other axes don't change the mix
    assert!((osc.get_sample(0.0) + 0.25).abs() < 0.0001);
}

#[test]
fn output_is_continuous_across_grid_points() {
    let mut osc = WtOsc::new(48000.0, 0);
    osc.set_position(0.999, 0.0, 0.0);
    load_raster_levels(&mut osc);
    let before = osc.get_sample(0.0) / SAMPLE_SCALE;
    osc.set_position(1.0, 0.0, 0.0);
    load_raster_levels(&mut osc);
    let after = osc.get_sample(0.0) / SAMPLE_SCALE;
    assert!((after - 9000.0).abs() < 0.5);
    assert!((after - before).abs() < 100.0, "{} -> {}", before, after);

    // Walk the whole X axis, reloading whenever the corners change
    osc.set_position(0.0, 0.0, 0.0);
    load_raster_levels(&mut osc);
    let mut last = osc.get_sample(0.0) / SAMPLE_SCALE;
    for step in 1..201 {
        osc.set_position(step as Float * 0.01, 0.0, 0.0);
        if osc.take_request().is_some() {
            osc.request_force();
            load_raster_levels(&mut osc);
        }
        let value = osc.get_sample(0.0) / SAMPLE_SCALE;
        assert!((value - last).abs() < 100.0, "{} -> {} at step {}", last, value, step);
        last = value;
    }
    assert!((last - 18000.0).abs() < 0.5);
}

#[test]
fn refresh_only_reloads_on_new_corners() {
    let mut osc = WtOsc::new(48000.0, 0);
    load_constant(&mut osc, 0, 0);
    osc.set_position(0.3, 0.2, 0.1);
    assert_eq!(osc.request(), ReloadRequest::Refresh);
    assert_eq!(osc.take_request(), None);
    assert_eq!(osc.request(), ReloadRequest::None);

    osc.set_position(1.3, 0.2, 0.9);
    assert_eq!(osc.take_request(), Some([Coord::new(1, 0, 0), Coord::new(1, 0, 1)]));

    osc.request_force();
    osc.request_refresh(); // Doesn't downgrade the force
    assert_eq!(osc.take_request(), Some([Coord::new(1, 0, 0), Coord::new(1, 0, 1)]));
    assert_eq!(osc.active_corners(), Some([Coord::new(0, 0, 0), Coord::new(1, 0, 0)]));
}

#[test]
fn phase_is_interpolated_and_wraps() {
    let mut osc = WtOsc::new(WT_TABLE_LEN as Float, 0);
    let corners = osc.target_corners();
    {
        let tables = osc.inactive_tables_mut();
        for i in 0..WT_TABLE_LEN {
            tables[0][i] = (i * 64) as i16;
        }
    }
    osc.commit_load(corners);
    // One table sample every two output samples
    let expected = [0.0, 32.0, 64.0, 96.0];
    for e in expected.iter() {
        assert!((osc.get_sample(0.5) - e * SAMPLE_SCALE).abs() < 1e-6);
    }
    osc.reset();
    for _ in 0..(2 * (WT_TABLE_LEN - 1) + 1) {
        osc.get_sample(0.5);
    }
    // Halfway between the last and the first sample
    let value = (511.0 * 64.0) / 2.0 * SAMPLE_SCALE;
    assert!((osc.get_sample(0.5) - value).abs() < 1e-4);
    assert!(osc.get_sample(0.5).abs() < 1e-6);
}

#[test]
fn table_switch_crossfades() {
    let mut osc = WtOsc::new(48000.0, 64);
    load_constant(&mut osc, 16384, 16384);
    skip_crossfade(&mut osc);
    assert_eq!(osc.get_sample(100.0), 0.5);

    osc.request_force();
    load_constant(&mut osc, -16384, -16384);
    let mut out = [0.0; 64];
    osc.render_block(100.0, &mut out);
    assert_eq!(out[0], 0.5);
    for pair in out.windows(2) {
        assert!(pair[1] < pair[0]);
        assert!(pair[0] - pair[1] < 0.02);
    }
    assert!(!osc.is_crossfading());
    assert_eq!(osc.get_sample(100.0), -0.5);
}

#[test]
fn committed_slot_alternates() {
    let mut osc = WtOsc::new(48000.0, 0);
    load_constant(&mut osc, 100, 100);
    osc.inactive_tables_mut()[0][0] = 7;
    assert_eq!(osc.get_sample(0.0), 100.0 * SAMPLE_SCALE);
    let corners = osc.target_corners();
    osc.commit_load(corners);
    assert_eq!(osc.get_sample(0.0), 7.0 * SAMPLE_SCALE);
}

#[test]
fn invalid_frequency_keeps_phase_usable() {
    let mut osc = WtOsc::new(48000.0, 0);
    load_constant(&mut osc, 1000, 1000);
    for frequency in [Float::NAN, Float::INFINITY, Float::MAX, 1e30, -440.0].iter() {
        for _ in 0..4 {
            let sample = osc.get_sample(*frequency);
            assert!(sample.is_finite());
            assert_eq!(sample, 1000.0 * SAMPLE_SCALE);
            assert!(osc.phase_frac.is_finite());
            assert!(osc.phase_int < WT_TABLE_LEN);
        }
    }
}
