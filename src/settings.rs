//! Engine configuration, stored as JSON.

use log::{error, info};
use serde::{Serialize, Deserialize};

use std::fs;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sample_rate: u32,
    pub render_threads: u32,
    pub crossfade_samples: usize,
    pub flash_base_address: u32,
    pub lowpass_nyquist_hz: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings{
            sample_rate: 48000,
            render_threads: 1,
            crossfade_samples: 64,
            flash_base_address: 0,
            lowpass_nyquist_hz: 22050,
        }
    }
}

impl Settings {
    /// Parse settings from a JSON string. Missing fields keep their default.
    ///
    /// ```
    /// use wavesphere::Settings;
    ///
    /// let settings = Settings::from_json(r#"{"render_threads": 4}"#).unwrap();
    /// assert_eq!(settings.render_threads, 4);
    /// assert_eq!(settings.sample_rate, 48000);
    /// ```
    pub fn from_json(data: &str) -> Result<Settings, ()> {
        let mut settings: Settings = serde_json::from_str(data).map_err(|e| {
            error!("Unable to parse settings: {}", e);
        })?;
        if settings.render_threads == 0 {
            settings.render_threads = 1;
        }
        Ok(settings)
    }

    /// Read settings from a JSON file.
    pub fn load(filename: &str) -> Result<Settings, ()> {
        info!("Reading settings [{}]", filename);
        let data = fs::read_to_string(filename).map_err(|e| {
            error!("Unable to read settings [{}]: {}", filename, e);
        })?;
        Settings::from_json(&data)
    }

    pub fn to_json(&self) -> Result<String, ()> {
        serde_json::to_string_pretty(self).map_err(|e| {
            error!("Unable to serialize settings: {}", e);
        })
    }
}

// ----------------------------------------------
//                  Unit tests
// ----------------------------------------------

#[test]
fn empty_json_gives_defaults() {
    assert_eq!(Settings::from_json("{}").unwrap(), Settings::default());
}

#[test]
fn settings_survive_json() {
    let mut settings = Settings::default();
    settings.crossfade_samples = 128;
    settings.flash_base_address = 0x40000;
    let json = settings.to_json().unwrap();
    assert_eq!(Settings::from_json(&json).unwrap(), settings);
}

#[test]
fn broken_json_is_rejected() {
    assert!(Settings::from_json("{\"sample_rate\": ").is_err());
    assert!(Settings::load("/nonexistent/settings.json").is_err());
}

#[test]
fn zero_threads_fall_back_to_one() {
    let settings = Settings::from_json(r#"{"render_threads": 0}"#).unwrap();
    assert_eq!(settings.render_threads, 1);
}
