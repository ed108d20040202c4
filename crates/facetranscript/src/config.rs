use facetranscript_core::{CaptureSettings, DetectorParams};
use facetranscript_store::{StoreError, TableName};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an optional TOML config file.
pub const CONFIG_PATH_ENV: &str = "FACETRANSCRIPT_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Runtime configuration.
///
/// Layered as defaults, then an optional TOML file, then
/// `FACETRANSCRIPT_*` environment variables. The CLI applies its flags last.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SQLite database file.
    pub database_path: PathBuf,
    pub table_name: String,
    /// Also write each captured face to `image_location/<user>.jpg`.
    pub save_image: bool,
    pub image_location: PathBuf,
    /// OpenCV Haar cascade XML for frontal faces.
    pub cascade_path: PathBuf,
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Frames discarded after the camera opens, while exposure settles.
    pub warmup_frames: u32,
    /// Longest wait for a single camera frame; 0 waits forever.
    pub frame_timeout_ms: u64,
    /// Frames to try before a capture gives up.
    pub max_attempts: u32,
    pub frame_interval_ms: u64,
    pub scale_factor: f64,
    pub min_neighbors: u32,
    /// Smallest face side, in pixels.
    pub min_face_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("db.sqlite3"),
            table_name: TableName::default().to_string(),
            save_image: false,
            image_location: PathBuf::from("dataset"),
            cascade_path: PathBuf::from("./haarcascade_frontalface_default.xml"),
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            warmup_frames: 4,
            frame_timeout_ms: 2000,
            max_attempts: 50,
            frame_interval_ms: 100,
            scale_factor: 1.3,
            min_neighbors: 5,
            min_face_size: 30,
        }
    }
}

impl Config {
    /// Load the full configuration.
    ///
    /// `path` wins over `FACETRANSCRIPT_CONFIG`. Without either, only the
    /// defaults and environment overrides apply.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));
        let mut config = match file {
            Some(file) => Self::from_file(&file)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Parse TOML; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override keys from `FACETRANSCRIPT_*` variables found by `lookup`.
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(&format!("FACETRANSCRIPT_{key}"));

        if let Some(v) = var("DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = var("TABLE_NAME") {
            self.table_name = v;
        }
        if let Some(v) = var("SAVE_IMAGE") {
            self.save_image = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = var("IMAGE_LOCATION") {
            self.image_location = PathBuf::from(v);
        }
        if let Some(v) = var("CASCADE_PATH") {
            self.cascade_path = PathBuf::from(v);
        }
        if let Some(v) = var("CAMERA_DEVICE") {
            self.camera_device = v;
        }
        env_parse(&var, "CAMERA_WIDTH", &mut self.camera_width);
        env_parse(&var, "CAMERA_HEIGHT", &mut self.camera_height);
        env_parse(&var, "WARMUP_FRAMES", &mut self.warmup_frames);
        env_parse(&var, "FRAME_TIMEOUT_MS", &mut self.frame_timeout_ms);
        env_parse(&var, "MAX_ATTEMPTS", &mut self.max_attempts);
        env_parse(&var, "FRAME_INTERVAL_MS", &mut self.frame_interval_ms);
        env_parse(&var, "SCALE_FACTOR", &mut self.scale_factor);
        env_parse(&var, "MIN_NEIGHBORS", &mut self.min_neighbors);
        env_parse(&var, "MIN_FACE_SIZE", &mut self.min_face_size);
    }

    pub fn table(&self) -> Result<TableName, StoreError> {
        self.table_name.parse()
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            save_image: self.save_image,
            image_location: self.image_location.clone(),
            max_attempts: self.max_attempts,
            frame_interval: Duration::from_millis(self.frame_interval_ms),
            ..CaptureSettings::default()
        }
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn detector_params(&self) -> DetectorParams {
        DetectorParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_size: (self.min_face_size, self.min_face_size),
            ..DetectorParams::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(v) = var(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(key, value = %v, "ignoring unparsable environment override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.database_path, PathBuf::from("db.sqlite3"));
        assert_eq!(config.table_name, "users");
        assert!(!config.save_image);
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!((config.camera_width, config.camera_height), (640, 480));
        assert_eq!(config.warmup_frames, 4);
        assert_eq!(config.frame_timeout(), Duration::from_secs(2));
        assert_eq!(config.detector_params().min_size, (30, 30));
    }

    #[test]
    fn test_toml_partial_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            table_name = "faces"
            save_image = true
            scale_factor = 1.1
            "#,
        )
        .unwrap();
        assert_eq!(config.table_name, "faces");
        assert!(config.save_image);
        assert_eq!(config.scale_factor, 1.1);
        assert_eq!(config.max_attempts, 50);
        assert_eq!(config.image_location, PathBuf::from("dataset"));
    }

    #[test]
    fn test_toml_unknown_key_is_rejected() {
        assert!(matches!(
            Config::from_toml_str("camera = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facetranscript.toml");
        std::fs::write(&path, "camera_device = \"/dev/video2\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.camera_device, "/dev/video2");

        assert!(matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FACETRANSCRIPT_DATABASE_PATH", "/tmp/people.sqlite3"),
            ("FACETRANSCRIPT_SAVE_IMAGE", "1"),
            ("FACETRANSCRIPT_MAX_ATTEMPTS", "7"),
            ("FACETRANSCRIPT_WARMUP_FRAMES", "0"),
            ("FACETRANSCRIPT_FRAME_TIMEOUT_MS", "750"),
            ("FACETRANSCRIPT_MIN_NEIGHBORS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.database_path, PathBuf::from("/tmp/people.sqlite3"));
        assert!(config.save_image);
        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.warmup_frames, 0);
        assert_eq!(config.frame_timeout(), Duration::from_millis(750));
        assert_eq!(config.min_neighbors, 5);
    }

    #[test]
    fn test_save_image_false_values() {
        for value in ["0", "false", "FALSE"] {
            let mut config = Config {
                save_image: true,
                ..Config::default()
            };
            config.apply_env(|k| (k == "FACETRANSCRIPT_SAVE_IMAGE").then(|| value.to_string()));
            assert!(!config.save_image, "{value}");
        }
    }

    #[test]
    fn test_capture_settings() {
        let config = Config {
            frame_interval_ms: 5,
            max_attempts: 3,
            ..Config::default()
        };
        let settings = config.capture_settings();
        assert_eq!(settings.frame_interval, Duration::from_millis(5));
        assert_eq!(settings.max_attempts, 3);
    }

    #[test]
    fn test_invalid_table_name() {
        let config = Config {
            table_name: "users; --".into(),
            ..Config::default()
        };
        assert!(config.table().is_err());
    }
}
