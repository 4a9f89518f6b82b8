use framestep_core::ControllerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "framestep.json";

/// Defaults for the command-line runner. Flags given on the command line
/// take precedence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Frames stepped by `run` when `--frames` is absent
    pub frames: u32,
    /// Playback speed for `play` (1.0 = 60 fps, <= 0 uncapped)
    pub speed: f64,
    /// Observer interval for `play`
    pub report_every: u32,
    /// Engine log level (off, error, warn, info, debug, trace)
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub controller: ControllerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            frames: 60,
            speed: 1.0,
            report_every: 60,
            log_level: "off".to_string(),
            log_file: None,
            controller: ControllerConfig::default(),
        }
    }
}

impl Settings {
    /// `framestep.json` next to the executable.
    pub fn config_path() -> PathBuf {
        let mut path = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."));
        path.push(CONFIG_FILE);
        path
    }

    /// Load from `explicit` or the default location.
    pub fn load(explicit: Option<&Path>) -> Self {
        match explicit {
            Some(path) => Self::load_from(path),
            None => Self::load_from(&Self::config_path()),
        }
    }

    /// Load settings from `path`, falling back to defaults on error
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!(
                        "Failed to parse {}: {}. Using defaults.",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => {
                // File doesn't exist or can't be read, use defaults
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("framestep_test_settings");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.frames, 60);
        assert_eq!(settings.speed, 1.0);
        assert_eq!(settings.log_level, "off");
        assert_eq!(settings.controller, ControllerConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let path = temp_file(
            "partial.json",
            r#"{ "frames": 300, "controller": { "base_fps": 50.0 } }"#,
        );
        let settings = Settings::load_from(&path);
        assert_eq!(settings.frames, 300);
        assert_eq!(settings.report_every, 60);
        assert_eq!(settings.controller.base_fps, 50.0);
        assert_eq!(settings.controller.max_lag_frames, 3);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_broken_file_falls_back_to_defaults() {
        let path = temp_file("broken.json", "{ frames: ");
        assert_eq!(Settings::load_from(&path), Settings::default());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_is_default() {
        let path = std::env::temp_dir().join("framestep_no_such_settings.json");
        assert_eq!(Settings::load(Some(path.as_path())), Settings::default());
    }

    #[test]
    fn test_settings_serialization() {
        let settings = Settings {
            speed: 4.0,
            log_file: Some(PathBuf::from("engine.log")),
            ..Default::default()
        };
        let json = serde_json::to_string(&settings).expect("Failed to serialize");
        let deserialized: Settings = serde_json::from_str(&json).expect("Failed to deserialize");
        assert_eq!(deserialized, settings);
    }
}
