//! Persistent storage of spheres in external flash.
//!
//! Every sphere occupies one flash sector. The first 4 bytes of a slot hold
//! the signature that identifies the sphere type, followed by the payload
//! (see `wavetable` for the layout). Factory slots come first, user slots
//! after them.
//!
//! The flash signature is the only source of truth for a slot's type. The
//! store keeps a cache of all types to avoid flash reads on the hot path,
//! and refreshes the cached entry from flash after every operation that
//! changes a slot.
//!
//! All erase and write operations stop the interpolation timer and wait for
//! running DMA reads to finish before touching the flash.

use super::flash::Flash;
use super::interp_timer::InterpTimer;
use super::slot_bitmap::SlotBitmap;
use super::wavetable::{Coord, Sphere, SphereType};
use super::wavetable::{SPHERE_PAYLOAD_LEN, SPHERE_SIG_LEN, SPHERE_SLOT_LEN, WT_TABLE_LEN};

use crossbeam::utils::Backoff;
use log::{debug, info, trace, warn};

use std::sync::Arc;

pub const FLASH_SECTOR_SIZE: usize = 0x10000;
pub const MAX_FACTORY_SPHERES: usize = 4;
pub const MAX_USER_SPHERES: usize = 28;
pub const MAX_TOTAL_SPHERES: usize = MAX_FACTORY_SPHERES + MAX_USER_SPHERES;

const WAVE_READ_BYTES: usize = WT_TABLE_LEN * 2;

pub struct SphereStore<F: Flash> {
    flash: F,
    base_addr: u32,
    timer: Arc<InterpTimer>,
    types: [SphereType; MAX_TOTAL_SPHERES],
    enabled: SlotBitmap,
    enabled_slots: Vec<usize>, // Logical index -> slot
    generation: u64,
    wave_bytes: [u8; WAVE_READ_BYTES],
}

impl<F: Flash> SphereStore<F> {
    /// Creates a store on top of the given flash.
    ///
    /// The type cache is filled from the flash signatures, all slots start
    /// out enabled.
    ///
    /// ```
    /// use wavesphere::{InterpTimer, MemFlash, SphereStore, SphereType, FLASH_SECTOR_SIZE};
    /// use std::sync::Arc;
    ///
    /// let flash = MemFlash::new(SphereStore::<MemFlash>::flash_size(0), FLASH_SECTOR_SIZE);
    /// let store = SphereStore::new(flash, 0, Arc::new(InterpTimer::new()));
    /// assert_eq!(store.cached_type(0), SphereType::Empty);
    /// ```
    pub fn new(flash: F, base_addr: u32, timer: Arc<InterpTimer>) -> SphereStore<F> {
        if flash.sector_size() > FLASH_SECTOR_SIZE || SPHERE_SLOT_LEN > FLASH_SECTOR_SIZE {
            warn!("Flash sector size {} does not fit slot layout", flash.sector_size());
        }
        let mut store = SphereStore{
            flash,
            base_addr,
            timer,
            types: [SphereType::Empty; MAX_TOTAL_SPHERES],
            enabled: SlotBitmap::all_set(MAX_TOTAL_SPHERES),
            enabled_slots: Vec::with_capacity(MAX_TOTAL_SPHERES),
            generation: 0,
            wave_bytes: [0; WAVE_READ_BYTES],
        };
        store.rebuild_cache();
        store
    }

    /// Number of flash bytes needed for all slots.
    pub fn flash_size(base_addr: u32) -> usize {
        base_addr as usize + MAX_TOTAL_SPHERES * FLASH_SECTOR_SIZE
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn timer(&self) -> &Arc<InterpTimer> {
        &self.timer
    }

    /// Incremented on every change of flash contents.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn clamp_slot(slot: usize) -> usize {
        if slot >= MAX_TOTAL_SPHERES {
            warn!("Sphere slot {} out of range, using {}", slot, MAX_TOTAL_SPHERES - 1);
            MAX_TOTAL_SPHERES - 1
        } else {
            slot
        }
    }

    /// Flash address of a slot. Slots out of range map to the last slot.
    pub fn slot_address(&self, slot: usize) -> u32 {
        let slot = SphereStore::<F>::clamp_slot(slot);
        self.base_addr + (slot * FLASH_SECTOR_SIZE) as u32
    }

    // ---------------
    // Sphere types
    // ---------------

    /// Read the signature of a slot from flash and classify it.
    ///
    /// Also refreshes the cached type of the slot.
    pub fn read_type(&mut self, slot: usize) -> SphereType {
        let slot = SphereStore::<F>::clamp_slot(slot);
        let mut sig = [0u8; SPHERE_SIG_LEN];
        let addr = self.slot_address(slot);
        self.flash.read(addr, &mut sig);
        let sphere_type = SphereType::from_signature(&sig);
        trace!("Slot {} has type {}", slot, sphere_type);
        self.types[slot] = sphere_type;
        sphere_type
    }

    /// Type of a slot as last read from flash.
    pub fn cached_type(&self, slot: usize) -> SphereType {
        self.types[SphereStore::<F>::clamp_slot(slot)]
    }

    /// Re-read all signatures and rebuild the logical index mapping.
    pub fn rebuild_cache(&mut self) {
        for slot in 0..MAX_TOTAL_SPHERES {
            self.read_type(slot);
        }
        self.update_enabled_slots();
        debug!("Sphere cache rebuilt, {} spheres enabled", self.enabled_slots.len());
    }

    // ---------------
    // Flash mutation
    // ---------------

    // Wait until no DMA transfer is reading from flash.
    fn wait_flash_idle(&mut self) {
        let backoff = Backoff::new();
        while self.flash.is_busy() {
            backoff.snooze();
        }
    }

    /// Erase a slot and write signature and payload.
    pub fn save(&mut self, slot: usize, sphere_type: SphereType, sphere: &Sphere) {
        let slot = SphereStore::<F>::clamp_slot(slot);
        let addr = self.slot_address(slot);
        let payload = sphere.to_bytes();
        {
            let timer = Arc::clone(&self.timer);
            let _pause = timer.pause();
            self.wait_flash_idle();
            self.flash.erase_sector(addr);
            if let Some(sig) = sphere_type.signature() {
                self.flash.write(addr, sig);
                self.flash.write(addr + SPHERE_SIG_LEN as u32, &payload);
            }
            self.generation += 1;
        }
        let stored = self.read_type(slot);
        self.update_enabled_slots();
        info!("Saved {} sphere to slot {} at {:#x}", stored, slot, addr);
    }

    // Overwrite only the signature of a slot.
    fn write_signature(&mut self, slot: usize, sphere_type: SphereType) {
        let addr = self.slot_address(slot);
        if let Some(sig) = sphere_type.signature() {
            let timer = Arc::clone(&self.timer);
            let _pause = timer.pause();
            self.wait_flash_idle();
            self.flash.write(addr, sig);
            self.generation += 1;
        }
    }

    /// Mark a user sphere as deleted, keeping its payload.
    ///
    /// Slots that are not user spheres are left alone. Returns the type of
    /// the slot afterwards.
    pub fn clear(&mut self, slot: usize) -> SphereType {
        let slot = SphereStore::<F>::clamp_slot(slot);
        let current = self.read_type(slot);
        if current != SphereType::User {
            debug!("Not clearing slot {} of type {}", slot, current);
            return current;
        }
        self.write_signature(slot, SphereType::Cleared);
        let result = self.read_type(slot);
        self.update_enabled_slots();
        info!("Cleared slot {}", slot);
        result
    }

    /// Restore a cleared user sphere.
    ///
    /// Slots that are not cleared are left alone. Returns the type of the
    /// slot afterwards.
    pub fn unclear(&mut self, slot: usize) -> SphereType {
        let slot = SphereStore::<F>::clamp_slot(slot);
        let current = self.read_type(slot);
        if current != SphereType::Cleared {
            debug!("Not restoring slot {} of type {}", slot, current);
            return current;
        }
        self.write_signature(slot, SphereType::User);
        let result = self.read_type(slot);
        self.update_enabled_slots();
        info!("Restored slot {}", slot);
        result
    }

    /// Rewrite every factory slot that doesn't hold a factory sphere.
    ///
    /// Returns the number of slots written.
    pub fn restore_factory_spheres(&mut self, reference: &[Sphere]) -> usize {
        let mut restored = 0;
        for slot in 0..MAX_FACTORY_SPHERES {
            if self.read_type(slot) == SphereType::Factory {
                continue;
            }
            match reference.get(slot) {
                Some(sphere) => {
                    self.save(slot, SphereType::Factory, sphere);
                    restored += 1;
                }
                None => warn!("No factory reference for slot {}", slot),
            }
        }
        info!("Restored {} factory spheres", restored);
        restored
    }

    // ---------------
    // Reading
    // ---------------

    /// Read the raw payload bytes of a slot, without signature.
    pub fn read_payload(&mut self, slot: usize) -> Vec<u8> {
        let addr = self.slot_address(slot) + SPHERE_SIG_LEN as u32;
        let mut payload = vec![0u8; SPHERE_PAYLOAD_LEN];
        self.flash.read(addr, &mut payload);
        payload
    }

    /// Read a complete sphere from a slot.
    pub fn load_sphere(&mut self, slot: usize) -> Sphere {
        debug!("Loading sphere from slot {}", slot);
        Sphere::from_bytes(&self.read_payload(slot))
    }

    /// Start a background read of one waveform's samples.
    pub fn begin_wave_read(&mut self, slot: usize, coord: Coord) {
        let addr = self.slot_address(slot) + Sphere::sample_offset(coord) as u32;
        self.flash.read_dma(addr, WAVE_READ_BYTES);
    }

    /// Collect a background waveform read.
    ///
    /// Returns false and leaves dest untouched while the transfer is still
    /// running.
    pub fn poll_wave_read(&mut self, dest: &mut [i16; WT_TABLE_LEN]) -> bool {
        if self.flash.is_busy() {
            return false;
        }
        if !self.flash.take_dma(&mut self.wave_bytes) {
            return false;
        }
        for (s, chunk) in dest.iter_mut().zip(self.wave_bytes.chunks_exact(2)) {
            *s = i16::from_le_bytes([chunk[0], chunk[1]]);
        }
        true
    }

    // ---------------
    // Enabled spheres
    // ---------------

    pub fn is_enabled(&self, slot: usize) -> bool {
        self.enabled.get(SphereStore::<F>::clamp_slot(slot))
    }

    pub fn set_enabled(&mut self, slot: usize, enabled: bool) {
        let slot = SphereStore::<F>::clamp_slot(slot);
        self.enabled.set(slot, enabled);
        self.update_enabled_slots();
    }

    pub fn enabled_bitmap(&self) -> &SlotBitmap {
        &self.enabled
    }

    /// Replace the enabled flags, e.g. after loading the parameter block.
    pub fn set_enabled_bitmap(&mut self, bitmap: SlotBitmap) {
        if bitmap.len() != MAX_TOTAL_SPHERES {
            warn!("Enabled bitmap has {} slots, expected {}", bitmap.len(), MAX_TOTAL_SPHERES);
        }
        let mut enabled = SlotBitmap::new(MAX_TOTAL_SPHERES);
        for slot in bitmap.iter_set() {
            enabled.set(slot, true);
        }
        self.enabled = enabled;
        self.update_enabled_slots();
    }

    // Map logical indices to filled and enabled slots, in slot order.
    fn update_enabled_slots(&mut self) {
        self.enabled_slots.clear();
        for slot in 0..MAX_TOTAL_SPHERES {
            if self.types[slot].is_filled() && self.enabled.get(slot) {
                self.enabled_slots.push(slot);
            }
        }
    }

    /// Number of spheres available to the player.
    pub fn num_enabled(&self) -> usize {
        self.enabled_slots.len()
    }

    /// Slot of the nth enabled sphere.
    pub fn slot_for_index(&self, index: usize) -> Option<usize> {
        self.enabled_slots.get(index).copied()
    }

    /// Logical index of a slot, None if it isn't filled and enabled.
    pub fn index_for_slot(&self, slot: usize) -> Option<usize> {
        self.enabled_slots.iter().position(|s| *s == slot)
    }

    pub fn enabled_slots(&self) -> &[usize] {
        &self.enabled_slots
    }
}

// ----------------------------------------------
//                  Unit tests
// ----------------------------------------------

#[cfg(test)]
use super::flash::MemFlash;

#[cfg(test)]
struct TestContext {
    store: SphereStore<MemFlash>,
}

#[cfg(test)]
impl TestContext {
    pub fn new() -> Self {
        let flash = MemFlash::new(SphereStore::<MemFlash>::flash_size(0), FLASH_SECTOR_SIZE);
        TestContext{store: SphereStore::new(flash, 0, Arc::new(InterpTimer::new()))}
    }

    pub fn sphere(seed: i16) -> Sphere {
        let mut sphere = Sphere::new();
        for (i, wave) in sphere.waves.iter_mut().enumerate() {
            wave.set_name(&format!("w{}", i));
            for (j, s) in wave.samples.iter_mut().enumerate() {
                *s = seed.wrapping_mul(31).wrapping_add((i * 512 + j) as i16);
            }
        }
        sphere
    }
}

// Flash wrapper checking that the timer is stopped during every mutation.
#[cfg(test)]
struct TimerCheckingFlash {
    inner: MemFlash,
    timer: Arc<InterpTimer>,
    violations: usize,
}

#[cfg(test)]
impl Flash for TimerCheckingFlash {
    fn sector_size(&self) -> usize { self.inner.sector_size() }
    fn erase_sector(&mut self, addr: u32) {
        if self.timer.is_running() { self.violations += 1; }
        self.inner.erase_sector(addr)
    }
    fn write(&mut self, addr: u32, data: &[u8]) {
        if self.timer.is_running() { self.violations += 1; }
        self.inner.write(addr, data)
    }
    fn read(&mut self, addr: u32, data: &mut [u8]) { self.inner.read(addr, data) }
    fn read_dma(&mut self, addr: u32, len: usize) { self.inner.read_dma(addr, len) }
    fn is_busy(&mut self) -> bool { self.inner.is_busy() }
    fn take_dma(&mut self, data: &mut [u8]) -> bool { self.inner.take_dma(data) }
}

#[test]
fn saved_sphere_round_trips() {
    let mut context = TestContext::new();
    let sphere = TestContext::sphere(7);
    context.store.save(5, SphereType::User, &sphere);
    assert_eq!(context.store.read_type(5), SphereType::User);
    assert_eq!(context.store.read_payload(5), sphere.to_bytes());
    assert_eq!(context.store.load_sphere(5), sphere);
}

#[test]
fn clear_and_unclear_only_touch_signature() {
    let mut context = TestContext::new();
    let sphere = TestContext::sphere(3);
    context.store.save(6, SphereType::User, &sphere);
    let payload = context.store.read_payload(6);

    assert_eq!(context.store.clear(6), SphereType::Cleared);
    assert_eq!(context.store.read_type(6), SphereType::Cleared);
    assert_eq!(context.store.read_payload(6), payload);

    assert_eq!(context.store.unclear(6), SphereType::User);
    assert_eq!(context.store.read_type(6), SphereType::User);
    assert_eq!(context.store.read_payload(6), payload);
}

#[test]
fn clear_in_wrong_state_is_ignored() {
    let mut context = TestContext::new();
    let sphere = TestContext::sphere(1);
    context.store.save(0, SphereType::Factory, &sphere);
    let generation = context.store.generation();
    assert_eq!(context.store.clear(0), SphereType::Factory);
    assert_eq!(context.store.unclear(0), SphereType::Factory);
    assert_eq!(context.store.clear(9), SphereType::Empty);
    assert_eq!(context.store.unclear(9), SphereType::Empty);
    context.store.save(10, SphereType::User, &sphere);
    assert_eq!(context.store.unclear(10), SphereType::User);
    assert_eq!(context.store.generation(), generation + 1);
}

#[test]
fn unknown_signature_reads_as_empty() {
    let mut context = TestContext::new();
    let addr = context.store.slot_address(8);
    context.store.flash_mut().write(addr, b"XYZ1");
    assert_eq!(context.store.read_type(8), SphereType::Empty);
}

#[test]
fn slot_address_is_clamped() {
    let context = TestContext::new();
    assert_eq!(context.store.slot_address(MAX_TOTAL_SPHERES),
               context.store.slot_address(MAX_TOTAL_SPHERES - 1));
    assert_eq!(context.store.slot_address(1000),
               context.store.slot_address(MAX_TOTAL_SPHERES - 1));
    assert_eq!(context.store.slot_address(2), 2 * FLASH_SECTOR_SIZE as u32);
}

#[test]
fn base_address_offsets_slots() {
    let flash = MemFlash::new(SphereStore::<MemFlash>::flash_size(0x20000), FLASH_SECTOR_SIZE);
    let store = SphereStore::new(flash, 0x20000, Arc::new(InterpTimer::new()));
    assert_eq!(store.slot_address(0), 0x20000);
    assert_eq!(store.slot_address(1), 0x30000);
}

#[test]
fn cache_can_be_rebuilt_from_flash() {
    let mut context = TestContext::new();
    let sphere = TestContext::sphere(2);
    context.store.save(1, SphereType::Factory, &sphere);
    context.store.save(12, SphereType::User, &sphere);
    context.store.save(13, SphereType::User, &sphere);
    context.store.clear(13);

    let flash = MemFlash::from_image(context.store.flash().image().to_vec(),
                                     SphereStore::<MemFlash>::flash_size(0),
                                     FLASH_SECTOR_SIZE).unwrap();
    let reopened = SphereStore::new(flash, 0, Arc::new(InterpTimer::new()));
    for slot in 0..MAX_TOTAL_SPHERES {
        assert_eq!(reopened.cached_type(slot), context.store.cached_type(slot));
    }
    assert_eq!(reopened.cached_type(13), SphereType::Cleared);
    assert_eq!(reopened.enabled_slots(), &[1, 12]);
}

#[test]
fn enumeration_contains_filled_and_enabled_slots() {
    let mut context = TestContext::new();
    let sphere = TestContext::sphere(4);
    let mut seed: u32 = 12345;
    for round in 0..6 {
        for slot in 0..MAX_TOTAL_SPHERES {
            seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
            let choice = (seed >> 16) % 5;
            if round == 0 || choice == 0 {
                let sphere_type = match (seed >> 8) % 3 {
                    0 => SphereType::User,
                    1 => SphereType::Factory,
                    _ => SphereType::Empty,
                };
                context.store.save(slot, sphere_type, &sphere);
            }
            if choice == 1 {
                context.store.clear(slot);
            }
            context.store.set_enabled(slot, (seed >> 20) % 3 != 0);
        }
        let mapping = context.store.enabled_slots().to_vec();
        assert!(mapping.windows(2).all(|w| w[0] < w[1]));
        let expected: Vec<usize> = (0..MAX_TOTAL_SPHERES)
            .filter(|s| context.store.read_type(*s).is_filled() && context.store.is_enabled(*s))
            .collect();
        assert_eq!(mapping, expected);
        for (index, slot) in mapping.iter().enumerate() {
            assert_eq!(context.store.slot_for_index(index), Some(*slot));
            assert_eq!(context.store.index_for_slot(*slot), Some(index));
        }
        assert_eq!(context.store.slot_for_index(mapping.len()), None);
    }
}

#[test]
fn disabled_sphere_keeps_its_data() {
    let mut context = TestContext::new();
    let sphere = TestContext::sphere(5);
    context.store.save(4, SphereType::User, &sphere);
    context.store.set_enabled(4, false);
    assert_eq!(context.store.index_for_slot(4), None);
    assert_eq!(context.store.read_type(4), SphereType::User);
    context.store.set_enabled(4, true);
    assert_eq!(context.store.index_for_slot(4), Some(0));
}

#[test]
fn enabled_bitmap_can_be_replaced() {
    let mut context = TestContext::new();
    let sphere = TestContext::sphere(5);
    context.store.save(4, SphereType::User, &sphere);
    context.store.save(7, SphereType::User, &sphere);
    let mut bitmap = SlotBitmap::new(MAX_TOTAL_SPHERES);
    bitmap.set(7, true);
    context.store.set_enabled_bitmap(bitmap);
    assert_eq!(context.store.enabled_slots(), &[7]);
}

#[test]
fn flash_is_only_written_with_timer_stopped() {
    let timer = Arc::new(InterpTimer::new());
    let mut inner = MemFlash::new(SphereStore::<MemFlash>::flash_size(0), FLASH_SECTOR_SIZE);
    inner.set_dma_latency(3);
    let flash = TimerCheckingFlash{inner, timer: Arc::clone(&timer), violations: 0};
    let mut store = SphereStore::new(flash, 0, Arc::clone(&timer));

    store.begin_wave_read(0, Coord::new(0, 0, 0)); // DMA still running when saving
    store.save(3, SphereType::User, &TestContext::sphere(9));
    store.clear(3);
    store.unclear(3);
    assert!(timer.is_running());
    assert_eq!(store.flash().violations, 0);
    assert_eq!(store.flash().inner.dma_collisions(), 0);
}

#[test]
fn factory_slots_are_restored() {
    let mut context = TestContext::new();
    let reference: Vec<Sphere> = (0..MAX_FACTORY_SPHERES).map(|i| TestContext::sphere(i as i16)).collect();
    context.store.save(1, SphereType::Factory, &reference[1]);
    context.store.save(2, SphereType::User, &TestContext::sphere(77));

    assert_eq!(context.store.restore_factory_spheres(&reference), MAX_FACTORY_SPHERES - 1);
    for slot in 0..MAX_FACTORY_SPHERES {
        assert_eq!(context.store.read_type(slot), SphereType::Factory);
        assert_eq!(context.store.load_sphere(slot), reference[slot]);
    }
    assert_eq!(context.store.restore_factory_spheres(&reference), 0);
}

#[test]
fn waveform_can_be_read_via_dma() {
    let mut context = TestContext::new();
    let sphere = TestContext::sphere(6);
    context.store.save(20, SphereType::User, &sphere);
    context.store.flash_mut().set_dma_latency(2);
    let coord = Coord::new(1, 2, 0);
    context.store.begin_wave_read(20, coord);
    let mut wave = [0i16; WT_TABLE_LEN];
    assert!(!context.store.poll_wave_read(&mut wave));
    assert!(wave.iter().all(|s| *s == 0));
    assert!(!context.store.poll_wave_read(&mut wave));
    assert!(context.store.poll_wave_read(&mut wave));
    assert_eq!(&wave[..], &sphere.wave(coord).samples[..]);
}
