//! Creates the factory spheres.
//!
//! The factory spheres are generated from lists of harmonics, so no sample
//! data needs to be stored. They are written to the factory slots when
//! these don't hold a factory sphere anymore, e.g. after a firmware update.
//!
//! Currently there are four spheres:
//!
//! * classic: sine, triangle, saw and square morphing into each other
//! * pulse: square waves with different pulse widths
//! * formant: single resonant peaks moving up the harmonic series
//! * organ: drawbar style mixes of harmonics

use super::Float;
use super::sphere_store::MAX_FACTORY_SPHERES;
use super::wavetable::{Coord, Sphere, BROWSE_TABLE, NUM_WAVES_PER_SPHERE, WT_DIM_SIZE, WT_TABLE_LEN};

use log::{debug, info};

use std::f64::consts::PI;

const NAME_PREFIXES: [&str; MAX_FACTORY_SPHERES] = ["cls", "pwm", "fmt", "org"];

pub struct WtCreator {
}

impl WtCreator {

    // ------------------
    // Harmonic helpers
    // ------------------

    // Add a sine wave with the given number of periods per table.
    fn add_sine_wave(table: &mut [Float], freq: Float, amplitude: Float, phase: Float) {
        let num_samples = table.len();
        let mult = freq * 2.0 * PI as Float / num_samples as Float;
        let offset = phase * 2.0 * PI as Float;
        for (i, sample) in table.iter_mut().enumerate() {
            *sample += (i as Float * mult + offset).sin() * amplitude;
        }
    }

    // Scale table so that the largest absolute value becomes 1.0.
    fn normalize(table: &mut [Float]) {
        let max = table.iter().fold(0.0, |max: Float, s| max.max(s.abs()));
        if max == 0.0 {
            return;
        }
        for sample in table.iter_mut() {
            *sample /= max;
        }
    }

    // Harmonic amplitude of the basic wave shapes.
    //
    // Shapes are 0 = sine, 1 = triangle, 2 = saw, 3 = square.
    fn shape_amplitude(shape: usize, harmonic: usize) -> Float {
        let h = harmonic as Float;
        let odd = harmonic & 1 == 1;
        match shape {
            0 => if harmonic == 1 { 1.0 } else { 0.0 },
            1 => {
                if !odd {
                    return 0.0;
                }
                let sign = if (harmonic / 2) & 1 == 0 { 1.0 } else { -1.0 };
                sign / (h * h)
            }
            2 => 1.0 / h,
            _ => if odd { 1.0 / h } else { 0.0 },
        }
    }

    // ------------------
    // Sphere shapes
    // ------------------

    // X selects the pair of shapes, Z morphs between them, Y sets the number
    // of harmonics.
    fn insert_classic(table: &mut [Float], coord: Coord) {
        let num_harmonics = 8 << (2 * coord.y);
        let amount = coord.z as Float / (WT_DIM_SIZE - 1) as Float;
        for h in 1..num_harmonics + 1 {
            let amplitude = WtCreator::shape_amplitude(coord.x, h) * (1.0 - amount)
                          + WtCreator::shape_amplitude(coord.x + 1, h) * amount;
            if amplitude != 0.0 {
                WtCreator::add_sine_wave(table, h as Float, amplitude, 0.0);
            }
        }
    }

    // Difference of two saw waves, the second one shifted by the pulse
    // width. The width grows along the browse order.
    fn insert_pulse(table: &mut [Float], coord: Coord) {
        let step = BROWSE_TABLE.iter().position(|c| *c == coord).unwrap_or(0);
        let width = (step + 1) as Float / (NUM_WAVES_PER_SPHERE + 2) as Float;
        for h in 1..65 {
            let amplitude = 1.0 / h as Float;
            WtCreator::add_sine_wave(table, h as Float, amplitude, 0.0);
            WtCreator::add_sine_wave(table, h as Float, -amplitude, width * h as Float);
        }
    }

    // Gaussian peak over the harmonic series. X and Y move the center, Z
    // widens the peak.
    fn insert_formant(table: &mut [Float], coord: Coord) {
        let center = 1.0 + (coord.x * WT_DIM_SIZE + coord.y) as Float * 3.0;
        let width = 0.75 + coord.z as Float * 1.5;
        WtCreator::add_sine_wave(table, 1.0, 0.25, 0.0);
        for h in 1..49 {
            let distance = (h as Float - center) / width;
            let amplitude = (-0.5 * distance * distance).exp();
            if amplitude > 0.001 {
                WtCreator::add_sine_wave(table, h as Float, amplitude, 0.0);
            }
        }
    }

    // Fundamental plus drawbars for the 2nd, 3rd and 4th harmonic, with
    // 6th and 8th harmonic following the products.
    fn insert_organ(table: &mut [Float], coord: Coord) {
        let bar = |v: usize| v as Float / (WT_DIM_SIZE - 1) as Float;
        let drawbars = [
            (1, 1.0),
            (2, bar(coord.x) * 0.7),
            (3, bar(coord.y) * 0.6),
            (4, bar(coord.z) * 0.5),
            (6, bar(coord.x) * bar(coord.y) * 0.4),
            (8, bar(coord.y) * bar(coord.z) * 0.3),
        ];
        for (harmonic, amplitude) in drawbars.iter() {
            if *amplitude > 0.0 {
                WtCreator::add_sine_wave(table, *harmonic as Float, *amplitude, 0.0);
            }
        }
    }

    fn create_sphere(index: usize, insert_wave: fn(&mut [Float], Coord)) -> Sphere {
        debug!("Creating factory sphere {}", index);
        let mut sphere = Sphere::new();
        let mut table = vec![0.0; WT_TABLE_LEN];
        for i in 0..NUM_WAVES_PER_SPHERE {
            let coord = Coord::from_index(i);
            for s in table.iter_mut() {
                *s = 0.0;
            }
            insert_wave(&mut table, coord);
            WtCreator::normalize(&mut table);
            let wave = sphere.wave_mut(coord);
            wave.set_from_float(&table);
            wave.set_name(&format!("{}{}{}{}", NAME_PREFIXES[index], coord.x, coord.y, coord.z));
        }
        sphere
    }

    /// Create the reference spheres for all factory slots.
    ///
    /// ```
    /// use wavesphere::{WtCreator, MAX_FACTORY_SPHERES};
    ///
    /// let spheres = WtCreator::create_factory_spheres();
    /// assert_eq!(spheres.len(), MAX_FACTORY_SPHERES);
    /// ```
    pub fn create_factory_spheres() -> Vec<Sphere> {
        info!("Creating factory spheres");
        let generators: [fn(&mut [Float], Coord); MAX_FACTORY_SPHERES] = [
            WtCreator::insert_classic,
            WtCreator::insert_pulse,
            WtCreator::insert_formant,
            WtCreator::insert_organ,
        ];
        generators.iter()
                  .enumerate()
                  .map(|(i, g)| WtCreator::create_sphere(i, *g))
                  .collect()
    }
}

// ----------------------------------------------
//                  Unit tests
// ----------------------------------------------

#[test]
fn all_factory_waves_are_full_scale() {
    let spheres = WtCreator::create_factory_spheres();
    for sphere in spheres.iter() {
        for wave in sphere.waves.iter() {
            assert!(wave.peak() >= 32766, "{:?}", wave);
        }
    }
}

#[test]
fn factory_waves_are_named_by_position() {
    let spheres = WtCreator::create_factory_spheres();
    assert_eq!(spheres[0].wave(Coord::new(0, 1, 2)).name_str(), "cls012");
    assert_eq!(spheres[3].wave(Coord::new(2, 2, 0)).name_str(), "org220");
}

#[test]
fn classic_sphere_starts_with_sine() {
    let spheres = WtCreator::create_factory_spheres();
    let wave = spheres[0].wave(Coord::new(0, 0, 0));
    assert_eq!(wave.samples[0], 0);
    assert!((wave.samples[WT_TABLE_LEN / 4] as i32 - 32767).abs() <= 1);
    assert!((wave.samples[WT_TABLE_LEN / 2] as i32).abs() <= 1);
}

#[test]
fn pulse_widths_differ() {
    let spheres = WtCreator::create_factory_spheres();
    let positive = |c: Coord| spheres[1].wave(c).samples.iter().filter(|s| **s > 0).count();
    // The positive part of the cycle shrinks as the width grows
    let first = positive(BROWSE_TABLE[0]);
    let last = positive(BROWSE_TABLE[NUM_WAVES_PER_SPHERE - 1]);
    assert!(first > WT_TABLE_LEN * 3 / 4);
    assert!(last < WT_TABLE_LEN / 4);
}

#[test]
fn factory_spheres_are_reproducible() {
    assert_eq!(WtCreator::create_factory_spheres(), WtCreator::create_factory_spheres());
}
