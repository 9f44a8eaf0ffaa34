//! Feeds the oscillator with waveforms.
//!
//! The loader is driven by the interpolation timer. On every tick it checks
//! the oscillator's reload request and fills the oscillator's inactive
//! table slot, either directly from the sphere under edit or with DMA reads
//! from flash. Flash reads take several ticks; a buffer is only handed to the
//! oscillator after the flash reports that the transfer has finished.
//!
//! While the timer is stopped (flash erase or write in progress) the loader
//! does nothing. A load that overlapped with a change of flash contents is
//! thrown away and started again.

use super::flash::Flash;
use super::render::SphereBuf;
use super::sphere_store::SphereStore;
use super::wavetable::{Coord, WT_TABLE_LEN};
use super::wt_oscillator::WtOsc;

use log::{debug, trace};

/// Where the oscillator's waveforms come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaveSource {
    Silence, // Nothing playable left
    SphereBuf,
    Flash{slot: usize},
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum LoadState {
    Idle,
    Reading{source: WaveSource, corners: [Coord; 2], corner: usize, generation: u64},
}

pub struct WtLoader {
    source: WaveSource,
    state: LoadState,
}

impl WtLoader {
    pub fn new(source: WaveSource) -> WtLoader {
        WtLoader{source, state: LoadState::Idle}
    }

    pub fn source(&self) -> WaveSource {
        self.source
    }

    /// Switch to another source and force a reload.
    pub fn set_source(&mut self, source: WaveSource, osc: &mut WtOsc) {
        debug!("Wave source changed to {:?}", source);
        self.source = source;
        osc.request_force();
    }

    /// True while a flash read is running.
    pub fn is_loading(&self) -> bool {
        self.state != LoadState::Idle
    }

    /// Run one timer tick.
    ///
    /// Returns true if new waveforms were handed to the oscillator.
    pub fn process<F: Flash>(&mut self,
                             osc: &mut WtOsc,
                             store: &mut SphereStore<F>,
                             sphere_buf: &SphereBuf) -> bool {
        if !store.timer().is_running() {
            trace!("Interpolation timer stopped, skipping load");
            return false;
        }
        match self.state {
            LoadState::Idle => {
                if osc.is_crossfading() {
                    return false;
                }
                let corners = match osc.take_request() {
                    Some(c) => c,
                    None => return false,
                };
                match self.source {
                    WaveSource::Silence => {
                        let tables = osc.inactive_tables_mut();
                        for table in tables.iter_mut() {
                            *table = [0; WT_TABLE_LEN];
                        }
                        osc.commit_load(corners);
                        true
                    }
                    WaveSource::SphereBuf => {
                        let tables = osc.inactive_tables_mut();
                        for (table, coord) in tables.iter_mut().zip(corners.iter()) {
                            table.copy_from_slice(&sphere_buf.wave(*coord).samples);
                        }
                        osc.commit_load(corners);
                        true
                    }
                    WaveSource::Flash{slot} => {
                        store.begin_wave_read(slot, corners[0]);
                        self.state = LoadState::Reading{
                            source: self.source,
                            corners,
                            corner: 0,
                            generation: store.generation(),
                        };
                        false
                    }
                }
            }
            LoadState::Reading{source, corners, corner, generation} => {
                if !store.poll_wave_read(&mut osc.inactive_tables_mut()[corner]) {
                    return false;
                }
                if source != self.source || generation != store.generation() {
                    debug!("Discarding stale load of {:?}", corners);
                    self.state = LoadState::Idle;
                    osc.request_force();
                    return false;
                }
                if corner == 0 {
                    if let WaveSource::Flash{slot} = source {
                        store.begin_wave_read(slot, corners[1]);
                    }
                    self.state = LoadState::Reading{source, corners, corner: 1, generation};
                    return false;
                }
                self.state = LoadState::Idle;
                osc.commit_load(corners);
                true
            }
        }
    }
}

// ----------------------------------------------
//                  Unit tests
// ----------------------------------------------

#[cfg(test)]
use super::flash::MemFlash;
#[cfg(test)]
use super::interp_timer::InterpTimer;
#[cfg(test)]
use super::sphere_store::FLASH_SECTOR_SIZE;
#[cfg(test)]
use super::wavetable::{Sphere, SphereType};
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
struct TestContext {
    store: SphereStore<MemFlash>,
    osc: WtOsc,
    sphere_buf: SphereBuf,
}

#[cfg(test)]
impl TestContext {
    pub fn new() -> Self {
        let flash = MemFlash::new(SphereStore::<MemFlash>::flash_size(0), FLASH_SECTOR_SIZE);
        let store = SphereStore::new(flash, 0, Arc::new(InterpTimer::new()));
        TestContext{store, osc: WtOsc::new(48000.0, 0), sphere_buf: SphereBuf::new()}
    }

    // Every waveform is constant, with a level derived from its index.
    pub fn sphere(offset: i16) -> Sphere {
        let mut sphere = Sphere::new();
        for (i, wave) in sphere.waves.iter_mut().enumerate() {
            wave.samples = [offset + i as i16 * 100; 512];
        }
        sphere
    }

    pub fn run(&mut self, loader: &mut WtLoader, ticks: usize) -> bool {
        let mut committed = false;
        for _ in 0..ticks {
            committed |= loader.process(&mut self.osc, &mut self.store, &self.sphere_buf);
        }
        committed
    }
}

#[test]
fn sphere_buf_is_loaded_immediately() {
    let mut context = TestContext::new();
    context.sphere_buf.load_sphere(&TestContext::sphere(1000));
    let mut loader = WtLoader::new(WaveSource::SphereBuf);
    assert!(context.run(&mut loader, 1));
    // Position 0: only the lower corner (index 0) is audible
    assert_eq!(context.osc.get_sample(0.0), 1000.0 / 32768.0);
    assert!(!context.run(&mut loader, 3)); // Nothing requested
}

#[test]
fn flash_load_waits_for_dma() {
    let mut context = TestContext::new();
    context.store.save(6, SphereType::User, &TestContext::sphere(2000));
    context.store.flash_mut().set_dma_latency(3);
    context.osc.set_position(1.0, 1.0, 1.0);
    let mut loader = WtLoader::new(WaveSource::Flash{slot: 6});

    assert!(!context.run(&mut loader, 1));
    assert!(loader.is_loading());
    assert_eq!(context.osc.active_corners(), None);
    assert!(!context.run(&mut loader, 4)); // First corner done, second running
    assert_eq!(context.osc.active_corners(), None);
    assert!(context.run(&mut loader, 4));
    assert!(!loader.is_loading());

    // Position (1,1,1) is the lower corner of the pair, index 13
    assert_eq!(context.osc.get_sample(0.0), 3300.0 / 32768.0);
}

#[test]
fn nothing_is_loaded_while_timer_is_stopped() {
    let mut context = TestContext::new();
    context.store.save(4, SphereType::User, &TestContext::sphere(0));
    let mut loader = WtLoader::new(WaveSource::Flash{slot: 4});
    let timer = Arc::clone(context.store.timer());
    {
        let _pause = timer.pause();
        assert!(!context.run(&mut loader, 10));
        assert!(!loader.is_loading());
    }
    assert!(context.run(&mut loader, 3));
}

#[test]
fn load_overlapping_a_save_is_restarted() {
    let mut context = TestContext::new();
    context.store.save(9, SphereType::User, &TestContext::sphere(100));
    context.store.flash_mut().set_dma_latency(2);
    let mut loader = WtLoader::new(WaveSource::Flash{slot: 9});
    context.run(&mut loader, 1);
    assert!(loader.is_loading());

    context.store.save(9, SphereType::User, &TestContext::sphere(5000));
    assert_eq!(context.store.flash().dma_collisions(), 0);
    assert!(!context.run(&mut loader, 1)); // Stale data is dropped
    assert!(context.run(&mut loader, 10));
    assert_eq!(context.osc.get_sample(0.0), 5000.0 / 32768.0);
}

#[test]
fn source_switch_forces_reload() {
    let mut context = TestContext::new();
    context.store.save(2, SphereType::User, &TestContext::sphere(300));
    context.sphere_buf.load_sphere(&TestContext::sphere(700));
    let mut loader = WtLoader::new(WaveSource::Flash{slot: 2});
    assert!(context.run(&mut loader, 3));
    assert_eq!(context.osc.get_sample(0.0), 300.0 / 32768.0);

    loader.set_source(WaveSource::SphereBuf, &mut context.osc);
    assert!(context.run(&mut loader, 1));
    assert_eq!(context.osc.get_sample(0.0), 700.0 / 32768.0);
}

#[test]
fn silence_replaces_playing_tables() {
    let mut context = TestContext::new();
    context.sphere_buf.load_sphere(&TestContext::sphere(1200));
    let mut loader = WtLoader::new(WaveSource::SphereBuf);
    assert!(context.run(&mut loader, 1));
    assert_eq!(context.osc.get_sample(0.0), 1200.0 / 32768.0);

    loader.set_source(WaveSource::Silence, &mut context.osc);
    assert!(context.run(&mut loader, 1));
    let mut out = [1.0; 16];
    context.osc.render_block(440.0, &mut out);
    assert!(out.iter().all(|s| *s == 0.0));
}
