//! Coordinates storage, editing and playback of spheres.
//!
//! The manager owns the sphere store, the sphere under edit, the recording
//! buffer and the oscillator with its loader. It is driven from the
//! foreground: user edits call into it directly, the interpolation timer
//! calls `tick`, and the audio callback calls `render_audio`.

use super::Float;
use super::effects::FxKind;
use super::flash::Flash;
use super::interp_timer::InterpTimer;
use super::render::{RecBuf, RenderParams, SphereBuf, SphereRenderer};
use super::settings::Settings;
use super::sphere_store::{SphereStore, MAX_TOTAL_SPHERES};
use super::wavetable::{Coord, SphereType, NUM_WAVES_PER_SPHERE, WT_TABLE_LEN};
use super::wt_creator::WtCreator;
use super::wt_loader::{WaveSource, WtLoader};
use super::wt_oscillator::WtOsc;

use log::{info, warn};
use serde::{Serialize, Deserialize};

use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SphereInfo {
    pub slot: usize,               // Physical flash slot
    pub sphere_type: SphereType,
    pub enabled: bool,
    pub index: Option<usize>,      // Logical index, None if not playable
}

pub struct WtManager<F: Flash> {
    store: SphereStore<F>,
    renderer: SphereRenderer,
    sphere_buf: SphereBuf,
    recbuf: RecBuf,
    osc: WtOsc,
    loader: WtLoader,
    editing: bool,
    current_slot: Option<usize>,
}

impl<F: Flash> WtManager<F> {
    /// Create a manager on top of the given flash.
    ///
    /// Playback starts with the first enabled sphere, if there is one.
    ///
    /// ```
    /// use wavesphere::{MemFlash, Settings, SphereStore, WtManager, FLASH_SECTOR_SIZE};
    ///
    /// let settings = Settings::default();
    /// let flash = MemFlash::new(SphereStore::<MemFlash>::flash_size(0), FLASH_SECTOR_SIZE);
    /// let mut manager = WtManager::new(flash, &settings);
    /// assert_eq!(manager.restore_factory_spheres(), 4);
    /// ```
    pub fn new(flash: F, settings: &Settings) -> WtManager<F> {
        let timer = Arc::new(InterpTimer::new());
        let store = SphereStore::new(flash, settings.flash_base_address, timer);
        let mut manager = WtManager{
            store,
            renderer: SphereRenderer::from_settings(settings),
            sphere_buf: SphereBuf::new(),
            recbuf: RecBuf::new(NUM_WAVES_PER_SPHERE * WT_TABLE_LEN),
            osc: WtOsc::from_settings(settings),
            loader: WtLoader::new(WaveSource::SphereBuf),
            editing: false,
            current_slot: None,
        };
        manager.select_sphere(0);
        manager
    }

    pub fn store(&self) -> &SphereStore<F> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SphereStore<F> {
        &mut self.store
    }

    pub fn sphere_buf(&self) -> &SphereBuf {
        &self.sphere_buf
    }

    /// Replace the recording buffer, e.g. with a fresh recording.
    pub fn set_recbuf(&mut self, recbuf: RecBuf) {
        self.recbuf = recbuf;
    }

    pub fn is_editing(&self) -> bool {
        self.editing
    }

    pub fn current_slot(&self) -> Option<usize> {
        self.current_slot
    }

    pub fn wave_source(&self) -> WaveSource {
        self.loader.source()
    }

    /// Rewrite damaged factory slots from the built-in spheres.
    pub fn restore_factory_spheres(&mut self) -> usize {
        let reference = WtCreator::create_factory_spheres();
        let restored = self.store.restore_factory_spheres(&reference);
        if self.current_slot.is_none() && !self.editing {
            self.select_sphere(0);
        }
        restored
    }

    // ------------------
    // Playback
    // ------------------

    /// Play the nth enabled sphere.
    ///
    /// Returns the slot of the sphere, None if there is no such sphere.
    pub fn select_sphere(&mut self, index: usize) -> Option<usize> {
        let slot = self.store.slot_for_index(index)?;
        self.current_slot = Some(slot);
        if !self.editing {
            self.loader.set_source(WaveSource::Flash{slot}, &mut self.osc);
        }
        info!("Selected sphere {} in slot {}", index, slot);
        Some(slot)
    }

    /// Move the playback position inside the sphere.
    pub fn set_position(&mut self, x: Float, y: Float, z: Float) {
        self.osc.set_position(x, y, z);
    }

    /// Run one interpolation timer tick.
    pub fn tick(&mut self) -> bool {
        self.loader.process(&mut self.osc, &mut self.store, &self.sphere_buf)
    }

    /// Fill a block of audio samples.
    pub fn render_audio(&mut self, frequency: Float, out: &mut [Float]) {
        self.osc.render_block(frequency, out);
    }

    // ------------------
    // Editing
    // ------------------

    /// Start editing a copy of the nth enabled sphere.
    ///
    /// The sphere is copied into the recording buffer and the sphere buffer,
    /// and playback switches to the sphere buffer.
    pub fn enter_edit(&mut self, index: usize) -> bool {
        let slot = match self.store.slot_for_index(index) {
            Some(slot) => slot,
            None => {
                warn!("No sphere with index {} to edit", index);
                return false;
            }
        };
        let sphere = self.store.load_sphere(slot);
        self.recbuf.fill_from_sphere(&sphere);
        self.sphere_buf = SphereBuf::new();
        self.sphere_buf.load_sphere(&sphere);
        self.current_slot = Some(slot);
        self.editing = true;
        self.loader.set_source(WaveSource::SphereBuf, &mut self.osc);
        info!("Editing sphere from slot {}", slot);
        true
    }

    /// Start editing a new sphere rendered from the recording buffer.
    pub fn enter_edit_recording(&mut self) {
        self.sphere_buf = SphereBuf::new();
        self.editing = true;
        self.loader.set_source(WaveSource::SphereBuf, &mut self.osc);
        self.render();
    }

    /// Render the whole sphere buffer and make the oscillator pick it up.
    pub fn render(&mut self) {
        self.renderer.render_full_sphere(&self.recbuf, &mut self.sphere_buf);
        self.osc.request_force();
    }

    pub fn set_fx(&mut self, kind: FxKind, coord: Coord, value: Float) {
        self.sphere_buf.set_fx(kind, coord, value);
        self.render();
    }

    pub fn set_fx_all(&mut self, kind: FxKind, value: Float) {
        self.sphere_buf.set_fx_all(kind, value);
        self.render();
    }

    pub fn set_render_params(&mut self, params: RenderParams) {
        self.sphere_buf.params = params;
        self.render();
    }

    /// Apply distortion and slew limiting to one rendered waveform.
    pub fn apply_shaping(&mut self, coord: Coord) {
        self.sphere_buf.apply_shaping(coord);
        self.osc.request_force();
    }

    /// Store the sphere under edit as user sphere.
    pub fn save_edit(&mut self, slot: usize) -> SphereType {
        let sphere = self.sphere_buf.to_sphere();
        self.store.save(slot, SphereType::User, &sphere);
        self.store.read_type(slot)
    }

    /// Leave edit mode, dropping unsaved changes.
    pub fn exit_edit(&mut self) {
        self.editing = false;
        match self.current_slot {
            Some(slot) => self.loader.set_source(WaveSource::Flash{slot}, &mut self.osc),
            None => self.osc.request_force(),
        }
        info!("Left edit mode");
    }

    // ------------------
    // Maintenance
    // ------------------

    pub fn clear_sphere(&mut self, slot: usize) -> SphereType {
        let sphere_type = self.store.clear(slot);
        self.update_current_slot();
        sphere_type
    }

    pub fn unclear_sphere(&mut self, slot: usize) -> SphereType {
        let sphere_type = self.store.unclear(slot);
        self.update_current_slot();
        sphere_type
    }

    pub fn set_enabled(&mut self, slot: usize, enabled: bool) {
        self.store.set_enabled(slot, enabled);
        self.update_current_slot();
    }

    // Move playback off a slot that lost its logical index.
    //
    // The next enabled sphere after the old slot takes over, or the last one
    // if there is none after it. Without any enabled sphere the oscillator
    // goes silent.
    fn update_current_slot(&mut self) {
        let slot = match self.current_slot {
            Some(slot) => slot,
            None => {
                if !self.editing {
                    self.select_sphere(0);
                }
                return;
            }
        };
        if self.store.index_for_slot(slot).is_some() {
            return;
        }
        let num_enabled = self.store.num_enabled();
        if num_enabled == 0 {
            warn!("Slot {} is gone and no sphere is left to play", slot);
            self.current_slot = None;
            if !self.editing {
                self.loader.set_source(WaveSource::Silence, &mut self.osc);
            }
            return;
        }
        let index = self.store.enabled_slots()
                              .iter()
                              .position(|s| *s > slot)
                              .unwrap_or(num_enabled - 1);
        warn!("Slot {} is gone, switching to sphere {}", slot, index);
        self.select_sphere(index);
    }

    /// State of every slot.
    pub fn slot_info(&self) -> Vec<SphereInfo> {
        (0..MAX_TOTAL_SPHERES).map(|slot| SphereInfo{
            slot,
            sphere_type: self.store.cached_type(slot),
            enabled: self.store.is_enabled(slot),
            index: self.store.index_for_slot(slot),
        }).collect()
    }
}

// ----------------------------------------------
//                  Unit tests
// ----------------------------------------------

#[cfg(test)]
use super::flash::MemFlash;
#[cfg(test)]
use super::sphere_store::{FLASH_SECTOR_SIZE, MAX_FACTORY_SPHERES};

#[cfg(test)]
struct TestContext {
    manager: WtManager<MemFlash>,
}

#[cfg(test)]
impl TestContext {
    pub fn new() -> Self {
        let mut settings = Settings::default();
        settings.crossfade_samples = 0;
        settings.render_threads = 2;
        let flash = MemFlash::new(SphereStore::<MemFlash>::flash_size(0), FLASH_SECTOR_SIZE);
        let mut manager = WtManager::new(flash, &settings);
        manager.restore_factory_spheres();
        TestContext{manager}
    }

    pub fn run_ticks(&mut self, ticks: usize) -> bool {
        let mut committed = false;
        for _ in 0..ticks {
            committed |= self.manager.tick();
        }
        committed
    }
}

#[test]
fn factory_spheres_are_listed() {
    let context = TestContext::new();
    let info = context.manager.slot_info();
    assert_eq!(info.len(), MAX_TOTAL_SPHERES);
    for (slot, i) in info.iter().enumerate() {
        assert_eq!(i.slot, slot);
        if slot < MAX_FACTORY_SPHERES {
            assert_eq!(i.sphere_type, SphereType::Factory);
            assert_eq!(i.index, Some(slot));
        } else {
            assert_eq!(i.sphere_type, SphereType::Empty);
            assert_eq!(i.index, None);
        }
        assert!(i.enabled);
    }
    assert_eq!(context.manager.current_slot(), Some(0));
}

#[test]
fn slot_info_serializes_to_json() {
    let context = TestContext::new();
    let json = serde_json::to_string(&context.manager.slot_info()[0]).unwrap();
    assert_eq!(json, r#"{"slot":0,"sphere_type":"Factory","enabled":true,"index":0}"#);
}

#[test]
fn playback_loads_from_flash() {
    let mut context = TestContext::new();
    assert!(context.run_ticks(3));
    let expected = WtCreator::create_factory_spheres()[0].wave(Coord::new(0, 0, 0)).samples[0];
    let mut out = [0.0; 1];
    context.manager.render_audio(0.0, &mut out);
    assert_eq!(out[0], expected as Float / 32768.0);
}

#[test]
fn edited_sphere_is_saved_as_user_sphere() {
    let mut context = TestContext::new();
    assert!(context.manager.enter_edit(1));
    assert!(context.manager.is_editing());
    let factory = WtCreator::create_factory_spheres();
    assert_eq!(context.manager.sphere_buf().to_sphere(), factory[1]);

    context.manager.set_fx(FxKind::Wavefold, Coord::new(1, 1, 1), 0.6);
    assert_ne!(context.manager.sphere_buf().to_sphere(), factory[1]);
    assert!(context.run_ticks(1)); // Edits play from RAM right away

    assert_eq!(context.manager.save_edit(10), SphereType::User);
    let saved = context.manager.store_mut().load_sphere(10);
    assert_eq!(saved, context.manager.sphere_buf().to_sphere());
    assert_eq!(context.manager.slot_info()[10].index, Some(MAX_FACTORY_SPHERES));

    context.manager.exit_edit();
    assert!(!context.manager.is_editing());
    assert!(context.run_ticks(3));
}

#[test]
fn bypassed_render_keeps_edited_sphere() {
    let mut context = TestContext::new();
    context.manager.enter_edit(2);
    context.manager.set_fx_all(FxKind::Normalize, 0.5);
    let factory = WtCreator::create_factory_spheres();
    assert_eq!(context.manager.sphere_buf().to_sphere(), factory[2]);
}

#[test]
fn cleared_sphere_leaves_enumeration() {
    let mut context = TestContext::new();
    context.manager.enter_edit(0);
    context.manager.save_edit(20);
    assert_eq!(context.manager.clear_sphere(20), SphereType::Cleared);
    assert_eq!(context.manager.slot_info()[20].index, None);
    assert_eq!(context.manager.unclear_sphere(20), SphereType::User);
    assert_eq!(context.manager.slot_info()[20].index, Some(MAX_FACTORY_SPHERES));
    context.manager.set_enabled(20, false);
    assert_eq!(context.manager.slot_info()[20].index, None);
    assert_eq!(context.manager.select_sphere(MAX_FACTORY_SPHERES), None);
}

#[test]
fn clearing_the_playing_sphere_selects_another() {
    let mut context = TestContext::new();
    context.manager.enter_edit(0);
    context.manager.save_edit(10);
    context.manager.exit_edit();
    assert_eq!(context.manager.select_sphere(MAX_FACTORY_SPHERES), Some(10));
    assert!(context.run_ticks(3));

    context.manager.clear_sphere(10);
    let slot = context.manager.current_slot();
    assert_eq!(slot, Some(MAX_FACTORY_SPHERES - 1)); // Last enabled sphere
    assert_eq!(context.manager.wave_source(), WaveSource::Flash{slot: MAX_FACTORY_SPHERES - 1});
    assert!(context.manager.store().index_for_slot(MAX_FACTORY_SPHERES - 1).is_some());

    context.manager.set_position(1.5, 0.0, 0.0);
    assert!(context.run_ticks(3));
    assert_eq!(context.manager.wave_source(), WaveSource::Flash{slot: MAX_FACTORY_SPHERES - 1});
}

#[test]
fn disabling_the_playing_sphere_selects_the_next_one() {
    let mut context = TestContext::new();
    context.manager.select_sphere(1);
    context.manager.set_enabled(1, false);
    assert_eq!(context.manager.current_slot(), Some(2));
    assert_eq!(context.manager.wave_source(), WaveSource::Flash{slot: 2});

    // Disabling a sphere that isn't playing keeps the selection
    context.manager.set_enabled(0, false);
    assert_eq!(context.manager.current_slot(), Some(2));
}

#[test]
fn playback_goes_silent_without_enabled_spheres() {
    let mut context = TestContext::new();
    assert!(context.run_ticks(3));
    for slot in 0..MAX_FACTORY_SPHERES {
        context.manager.set_enabled(slot, false);
    }
    assert_eq!(context.manager.current_slot(), None);
    assert_eq!(context.manager.wave_source(), WaveSource::Silence);
    assert!(context.run_ticks(1));
    let mut out = [1.0; 32];
    context.manager.render_audio(440.0, &mut out);
    assert!(out.iter().all(|s| *s == 0.0));

    // Playback picks up again once a sphere is enabled
    context.manager.set_enabled(3, true);
    assert_eq!(context.manager.current_slot(), Some(3));
    assert!(context.run_ticks(3));
}

#[test]
fn recording_is_rendered_and_played() {
    let mut context = TestContext::new();
    let mut samples = vec![0i16; NUM_WAVES_PER_SPHERE * WT_TABLE_LEN];
    for (i, sample) in samples.iter_mut().enumerate() {
        let phase = (i % WT_TABLE_LEN) as f64 / WT_TABLE_LEN as f64;
        *sample = ((phase * 2.0 * std::f64::consts::PI).sin() * 16000.0) as i16;
    }
    context.manager.set_recbuf(RecBuf::from_samples(samples));
    context.manager.enter_edit_recording();
    assert!(context.manager.is_editing());
    assert_eq!(context.manager.wave_source(), WaveSource::SphereBuf);

    let wave = context.manager.sphere_buf().wave(Coord::new(0, 0, 0)).samples;
    assert!(wave.iter().map(|s| (*s as i32).abs()).max().unwrap_or(0) >= 32766); // Normalized
    assert!(context.run_ticks(1));

    // One table sample per output sample
    let frequency = Settings::default().sample_rate as Float / WT_TABLE_LEN as Float;
    let mut out = [0.0; 64];
    context.manager.render_audio(frequency, &mut out);
    for (i, sample) in out.iter().enumerate() {
        assert_eq!(*sample, wave[i] as Float / 32768.0);
    }
}

#[test]
fn editing_unknown_index_fails() {
    let mut context = TestContext::new();
    assert!(!context.manager.enter_edit(MAX_TOTAL_SPHERES));
    assert!(!context.manager.is_editing());
}
