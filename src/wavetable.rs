//! Waveforms and spheres.
//!
//! A sphere is a 3x3x3 cube of single cycle waveforms. Every waveform holds
//! 512 signed 16 bit samples and a short display name. Inside a sphere the
//! waveforms are stored in raster order (x major, then y, then z), which is
//! also the order they take in a flash slot.
//!
//! Rendering, playback and the UI walk the cube in a different order, the
//! browse table. It snakes through the cube so that consecutive entries are
//! always direct neighbours.
//!
//! Flash slot layout:
//!
//! ```text
//! [4 byte signature][27 x ([8 byte name][512 x i16 little endian])]
//! ```

use super::Float;

use log::{debug, warn};

use std::fmt;

pub const WT_TABLE_LEN: usize = 512;
pub const WT_DIM_SIZE: usize = 3;
pub const NUM_WAVES_PER_SPHERE: usize = WT_DIM_SIZE * WT_DIM_SIZE * WT_DIM_SIZE;
pub const WAVEFORM_NAME_LEN: usize = 8;

pub const SPHERE_SIG_LEN: usize = 4;
pub const WAVEFORM_BYTES: usize = WAVEFORM_NAME_LEN + WT_TABLE_LEN * 2;
pub const SPHERE_PAYLOAD_LEN: usize = NUM_WAVES_PER_SPHERE * WAVEFORM_BYTES;
pub const SPHERE_SLOT_LEN: usize = SPHERE_SIG_LEN + SPHERE_PAYLOAD_LEN;

const SIG_USER: &[u8; SPHERE_SIG_LEN] = b"US1\0";
const SIG_FACTORY: &[u8; SPHERE_SIG_LEN] = b"FS1\0";
const SIG_CLEARED: &[u8; SPHERE_SIG_LEN] = b"CS1\0";

/// Round a float sample value and clamp it to the 16 bit range.
pub(crate) fn to_sample(value: Float) -> i16 {
    num::clamp(value.round(), i16::MIN as Float, i16::MAX as Float) as i16
}

/// Position of a waveform inside a sphere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Coord {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Coord {
    pub const fn new(x: usize, y: usize, z: usize) -> Coord {
        Coord{x, y, z}
    }

    /// Build a coordinate from arbitrary values, clamping every axis to the
    /// cube. Positions never wrap around.
    ///
    /// ```
    /// use wavesphere::Coord;
    ///
    /// assert_eq!(Coord::clamped(-1, 1, 7), Coord::new(0, 1, 2));
    /// ```
    pub fn clamped(x: i32, y: i32, z: i32) -> Coord {
        let max = (WT_DIM_SIZE - 1) as i32;
        Coord{
            x: num::clamp(x, 0, max) as usize,
            y: num::clamp(y, 0, max) as usize,
            z: num::clamp(z, 0, max) as usize,
        }
    }

    /// Raster index of this coordinate inside a sphere.
    pub fn index(&self) -> usize {
        (self.x * WT_DIM_SIZE + self.y) * WT_DIM_SIZE + self.z
    }

    pub fn from_index(index: usize) -> Coord {
        let index = if index >= NUM_WAVES_PER_SPHERE {
            warn!("Waveform index {} out of range, clamping", index);
            NUM_WAVES_PER_SPHERE - 1
        } else {
            index
        };
        Coord{
            x: index / (WT_DIM_SIZE * WT_DIM_SIZE),
            y: (index / WT_DIM_SIZE) % WT_DIM_SIZE,
            z: index % WT_DIM_SIZE,
        }
    }
}

/// Traversal order shared by rendering, playback and the UI.
pub const BROWSE_TABLE: [Coord; NUM_WAVES_PER_SPHERE] = [
    Coord::new(0, 0, 0), Coord::new(0, 0, 1), Coord::new(0, 0, 2),
    Coord::new(0, 1, 2), Coord::new(0, 1, 1), Coord::new(0, 1, 0),
    Coord::new(0, 2, 0), Coord::new(0, 2, 1), Coord::new(0, 2, 2),
    Coord::new(1, 2, 2), Coord::new(1, 2, 1), Coord::new(1, 2, 0),
    Coord::new(1, 1, 0), Coord::new(1, 1, 1), Coord::new(1, 1, 2),
    Coord::new(1, 0, 2), Coord::new(1, 0, 1), Coord::new(1, 0, 0),
    Coord::new(2, 0, 0), Coord::new(2, 0, 1), Coord::new(2, 0, 2),
    Coord::new(2, 1, 2), Coord::new(2, 1, 1), Coord::new(2, 1, 0),
    Coord::new(2, 2, 0), Coord::new(2, 2, 1), Coord::new(2, 2, 2),
];

/// Type of the sphere stored in a flash slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SphereType {
    Empty,
    User,
    Factory,
    Cleared,
}

impl SphereType {
    /// Classify a raw signature. Anything unknown counts as empty.
    pub fn from_signature(sig: &[u8]) -> SphereType {
        if sig.len() < SPHERE_SIG_LEN {
            return SphereType::Empty;
        }
        let sig = &sig[..SPHERE_SIG_LEN];
        if sig == SIG_USER {
            SphereType::User
        } else if sig == SIG_FACTORY {
            SphereType::Factory
        } else if sig == SIG_CLEARED {
            SphereType::Cleared
        } else {
            SphereType::Empty
        }
    }

    /// The signature written for this type, None for Empty.
    pub fn signature(&self) -> Option<&'static [u8; SPHERE_SIG_LEN]> {
        match self {
            SphereType::User => Some(SIG_USER),
            SphereType::Factory => Some(SIG_FACTORY),
            SphereType::Cleared => Some(SIG_CLEARED),
            SphereType::Empty => None,
        }
    }

    /// True if the slot holds a sphere the player may use.
    pub fn is_filled(&self) -> bool {
        matches!(self, SphereType::User | SphereType::Factory)
    }
}

impl fmt::Display for SphereType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SphereType::Empty => "empty",
            SphereType::User => "user",
            SphereType::Factory => "factory",
            SphereType::Cleared => "cleared",
        };
        write!(f, "{}", name)
    }
}

/// A single cycle waveform.
#[derive(Clone, PartialEq)]
pub struct Waveform {
    pub samples: [i16; WT_TABLE_LEN],
    pub name: [u8; WAVEFORM_NAME_LEN],
}

impl Default for Waveform {
    fn default() -> Self {
        Waveform{samples: [0; WT_TABLE_LEN], name: [0; WAVEFORM_NAME_LEN]}
    }
}

impl fmt::Debug for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Waveform({:?}, peak {})", self.name_str(), self.peak())
    }
}

impl Waveform {
    /// Set the display name. Longer names are cut off, shorter ones padded
    /// with NUL bytes.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; WAVEFORM_NAME_LEN];
        for (dest, src) in self.name.iter_mut().zip(name.bytes()) {
            *dest = src;
        }
    }

    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(WAVEFORM_NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Largest absolute sample value.
    pub fn peak(&self) -> i32 {
        self.samples.iter().map(|s| (*s as i32).abs()).max().unwrap_or(0)
    }

    /// Fill the waveform from float values in the range [-1.0, 1.0].
    pub fn set_from_float(&mut self, table: &[Float]) {
        for (dest, src) in self.samples.iter_mut().zip(table.iter()) {
            *dest = to_sample(*src * i16::MAX as Float);
        }
    }

    fn write_bytes(&self, dest: &mut [u8]) {
        dest[..WAVEFORM_NAME_LEN].copy_from_slice(&self.name);
        for (chunk, s) in dest[WAVEFORM_NAME_LEN..].chunks_exact_mut(2).zip(self.samples.iter()) {
            chunk.copy_from_slice(&s.to_le_bytes());
        }
    }

    fn read_bytes(&mut self, src: &[u8]) {
        self.name.copy_from_slice(&src[..WAVEFORM_NAME_LEN]);
        for (s, chunk) in self.samples.iter_mut().zip(src[WAVEFORM_NAME_LEN..].chunks_exact(2)) {
            *s = i16::from_le_bytes([chunk[0], chunk[1]]);
        }
    }
}

/// A 3x3x3 cube of waveforms.
#[derive(Clone, Debug, PartialEq)]
pub struct Sphere {
    pub waves: Vec<Waveform>, // Raster order, see Coord::index
}

impl Default for Sphere {
    fn default() -> Self {
        Sphere::new()
    }
}

impl Sphere {
    /// Creates a sphere holding 27 silent waveforms.
    pub fn new() -> Sphere {
        Sphere{waves: vec![Waveform::default(); NUM_WAVES_PER_SPHERE]}
    }

    pub fn wave(&self, coord: Coord) -> &Waveform {
        &self.waves[coord.index()]
    }

    pub fn wave_mut(&mut self, coord: Coord) -> &mut Waveform {
        &mut self.waves[coord.index()]
    }

    /// Byte offset of a waveform's samples inside a slot, signature included.
    pub fn sample_offset(coord: Coord) -> usize {
        SPHERE_SIG_LEN + coord.index() * WAVEFORM_BYTES + WAVEFORM_NAME_LEN
    }

    /// Serialize into the flash payload layout (without signature).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; SPHERE_PAYLOAD_LEN];
        for (chunk, wave) in bytes.chunks_exact_mut(WAVEFORM_BYTES).zip(self.waves.iter()) {
            wave.write_bytes(chunk);
        }
        bytes
    }

    /// Deserialize from the flash payload layout (without signature).
    ///
    /// A short buffer leaves the remaining waveforms silent.
    pub fn from_bytes(bytes: &[u8]) -> Sphere {
        if bytes.len() < SPHERE_PAYLOAD_LEN {
            warn!("Sphere payload too short: {} bytes, expected {}", bytes.len(), SPHERE_PAYLOAD_LEN);
        }
        let mut sphere = Sphere::new();
        for (wave, chunk) in sphere.waves.iter_mut().zip(bytes.chunks_exact(WAVEFORM_BYTES)) {
            wave.read_bytes(chunk);
        }
        debug!("Decoded sphere from {} bytes", bytes.len());
        sphere
    }
}

// ----------------------------------------------
//                  Unit tests
// ----------------------------------------------

#[test]
fn slot_layout_has_expected_size() {
    assert_eq!(WAVEFORM_BYTES, 1032);
    assert_eq!(SPHERE_PAYLOAD_LEN, 27 * 1032);
    assert_eq!(SPHERE_SLOT_LEN, 4 + 27 * 1032);
}

#[test]
fn browse_table_visits_every_coordinate_once() {
    let mut seen = [false; NUM_WAVES_PER_SPHERE];
    for c in BROWSE_TABLE.iter() {
        assert!(!seen[c.index()]);
        seen[c.index()] = true;
    }
    assert!(seen.iter().all(|s| *s));
}

#[test]
fn browse_table_only_steps_to_neighbours() {
    for pair in BROWSE_TABLE.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let dist = (a.x as i32 - b.x as i32).abs()
                 + (a.y as i32 - b.y as i32).abs()
                 + (a.z as i32 - b.z as i32).abs();
        assert_eq!(dist, 1);
    }
}

#[test]
fn coord_index_round_trips() {
    for i in 0..NUM_WAVES_PER_SPHERE {
        assert_eq!(Coord::from_index(i).index(), i);
    }
    assert_eq!(Coord::new(1, 2, 0).index(), 15);
}

#[test]
fn coord_is_clamped_not_wrapped() {
    assert_eq!(Coord::clamped(3, -5, 2), Coord::new(2, 0, 2));
    assert_eq!(Coord::from_index(99), Coord::new(2, 2, 2));
}

#[test]
fn signatures_are_classified() {
    assert_eq!(SphereType::from_signature(b"US1\0"), SphereType::User);
    assert_eq!(SphereType::from_signature(b"FS1\0"), SphereType::Factory);
    assert_eq!(SphereType::from_signature(b"CS1\0"), SphereType::Cleared);
    assert_eq!(SphereType::from_signature(&[0xFF; 4]), SphereType::Empty);
    assert_eq!(SphereType::from_signature(b"US2\0"), SphereType::Empty);
    assert_eq!(SphereType::from_signature(b"US"), SphereType::Empty);
}

#[test]
fn payload_layout_is_little_endian() {
    let mut sphere = Sphere::new();
    sphere.waves[1].set_name("ab");
    sphere.waves[1].samples[0] = 0x1234;
    sphere.waves[1].samples[511] = -2;
    let bytes = sphere.to_bytes();
    let base = WAVEFORM_BYTES;
    assert_eq!(&bytes[base..base + 3], &[b'a', b'b', 0]);
    assert_eq!(bytes[base + WAVEFORM_NAME_LEN], 0x34);
    assert_eq!(bytes[base + WAVEFORM_NAME_LEN + 1], 0x12);
    assert_eq!(bytes[base + WAVEFORM_BYTES - 2], 0xFE);
    assert_eq!(bytes[base + WAVEFORM_BYTES - 1], 0xFF);
    assert_eq!(Sphere::from_bytes(&bytes), sphere);
}

#[test]
fn long_names_are_cut_off() {
    let mut wave = Waveform::default();
    wave.set_name("much too long");
    assert_eq!(wave.name_str(), "much too");
}
