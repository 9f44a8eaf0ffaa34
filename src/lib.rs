#![allow(dead_code)]
#![allow(unused_imports)]

mod effects;
mod flash;
mod interp_timer;
mod lowpass;
mod render;
mod resampler;
mod settings;
mod slot_bitmap;
mod sphere_store;
mod wavetable;
mod wt_creator;
mod wt_loader;
mod wt_manager;
mod wt_oscillator;

pub use effects::{FxKind, FxParams, FX_EPSILON, NUM_FX_KINDS};
pub use flash::{Flash, InvalidImageSize, MemFlash};
pub use interp_timer::{InterpTimer, TimerPause};
pub use lowpass::{FftLowpass, Harmonic, LowpassFilter};
pub use render::{overlap_smooth, put_waveform_in_sphere, render_one_waveform};
pub use render::{RecBuf, RenderParams, SphereBuf, SphereRenderer};
pub use resampler::{resample_hermite, PitchedVoice, ReadPos, ResampleMode, ResamplerState};
pub use settings::Settings;
pub use slot_bitmap::SlotBitmap;
pub use sphere_store::{SphereStore, FLASH_SECTOR_SIZE, MAX_FACTORY_SPHERES, MAX_TOTAL_SPHERES, MAX_USER_SPHERES};
pub use wavetable::{Coord, Sphere, SphereType, Waveform, BROWSE_TABLE};
pub use wavetable::{NUM_WAVES_PER_SPHERE, SPHERE_PAYLOAD_LEN, SPHERE_SIG_LEN, SPHERE_SLOT_LEN};
pub use wavetable::{WAVEFORM_NAME_LEN, WT_DIM_SIZE, WT_TABLE_LEN};
pub use wt_creator::WtCreator;
pub use wt_loader::{WaveSource, WtLoader};
pub use wt_manager::{SphereInfo, WtManager};
pub use wt_oscillator::{ReloadRequest, WtOsc};

#[cfg(feature = "use_double_precision")]
pub type Float = f64;
#[cfg(not(feature = "use_double_precision"))]
pub type Float = f32;
