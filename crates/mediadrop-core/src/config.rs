//! Persisted settings and timing policy.
//!
//! Settings live as JSON under the user's config directory and are loaded
//! once at startup. The only value a user edits routinely is the optional
//! authentication token; everything else has defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, FileSystemError, Result};

const MIB: u64 = 1024 * 1024;

// =============================================================================
// Timeouts
// =============================================================================

/// Timing policy for one download run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Outer budget for the whole engine call, in seconds.
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Filesystem polling interval, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive unchanged polls that confirm a finished merge.
    #[serde(default = "default_merge_stable_polls")]
    pub merge_stable_polls: u32,
    /// Consecutive unchanged polls that confirm the final file.
    #[serde(default = "default_final_stable_polls")]
    pub final_stable_polls: u32,
    /// Seconds without size change before a stuck warning.
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
    /// Post-processing budget for small downloads, in seconds.
    #[serde(default = "default_post_processing_small_secs")]
    pub post_processing_small_secs: u64,
    /// Post-processing budget for large downloads, in seconds.
    #[serde(default = "default_post_processing_large_secs")]
    pub post_processing_large_secs: u64,
    /// Size at which a download counts as large for post-processing.
    #[serde(default = "default_post_processing_threshold_bytes")]
    pub post_processing_threshold_bytes: u64,
    /// Artwork fallback budget for small files, in seconds.
    #[serde(default = "default_fallback_small_secs")]
    pub fallback_small_secs: u64,
    /// Artwork fallback budget for large files, in seconds.
    #[serde(default = "default_fallback_large_secs")]
    pub fallback_large_secs: u64,
    /// Size at which a file counts as large for the fallback step.
    #[serde(default = "default_fallback_threshold_bytes")]
    pub fallback_threshold_bytes: u64,
}

const fn default_download_timeout_secs() -> u64 {
    2 * 60 * 60
}

const fn default_poll_interval_ms() -> u64 {
    1_000
}

const fn default_merge_stable_polls() -> u32 {
    3
}

const fn default_final_stable_polls() -> u32 {
    2
}

const fn default_stuck_threshold_secs() -> u64 {
    3 * 60
}

const fn default_post_processing_small_secs() -> u64 {
    10 * 60
}

const fn default_post_processing_large_secs() -> u64 {
    30 * 60
}

const fn default_post_processing_threshold_bytes() -> u64 {
    100 * MIB
}

const fn default_fallback_small_secs() -> u64 {
    15
}

const fn default_fallback_large_secs() -> u64 {
    60
}

const fn default_fallback_threshold_bytes() -> u64 {
    50 * MIB
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            download_timeout_secs: default_download_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            merge_stable_polls: default_merge_stable_polls(),
            final_stable_polls: default_final_stable_polls(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            post_processing_small_secs: default_post_processing_small_secs(),
            post_processing_large_secs: default_post_processing_large_secs(),
            post_processing_threshold_bytes: default_post_processing_threshold_bytes(),
            fallback_small_secs: default_fallback_small_secs(),
            fallback_large_secs: default_fallback_large_secs(),
            fallback_threshold_bytes: default_fallback_threshold_bytes(),
        }
    }
}

impl TimeoutConfig {
    /// Outer budget for the engine call.
    #[must_use]
    pub const fn download_budget(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Polling interval, never below 10ms.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    /// Stall duration that triggers a stuck warning.
    #[must_use]
    pub const fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    /// Post-processing budget for a download of `size_bytes`.
    #[must_use]
    pub const fn post_processing_budget(&self, size_bytes: u64) -> Duration {
        if size_bytes < self.post_processing_threshold_bytes {
            Duration::from_secs(self.post_processing_small_secs)
        } else {
            Duration::from_secs(self.post_processing_large_secs)
        }
    }

    /// Artwork fallback budget for a file of `size_bytes`.
    #[must_use]
    pub const fn fallback_budget(&self, size_bytes: u64) -> Duration {
        if size_bytes < self.fallback_threshold_bytes {
            Duration::from_secs(self.fallback_small_secs)
        } else {
            Duration::from_secs(self.fallback_large_secs)
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// User settings persisted between runs.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppSettings {
    /// Directory receiving downloaded files.
    #[serde(default = "default_downloads_directory")]
    pub downloads_directory: PathBuf,
    /// Optional token for the authenticated source class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Pass the engine's certificate-check bypass flag.
    #[serde(default)]
    pub skip_certificate_check: bool,
    /// Extraction engine executable.
    #[serde(default = "default_yt_dlp_path")]
    pub yt_dlp_path: PathBuf,
    /// Transcoding engine executable.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Media probe executable.
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    /// Timing policy.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl std::fmt::Debug for AppSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppSettings")
            .field("downloads_directory", &self.downloads_directory)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("skip_certificate_check", &self.skip_certificate_check)
            .field("yt_dlp_path", &self.yt_dlp_path)
            .field("ffmpeg_path", &self.ffmpeg_path)
            .field("ffprobe_path", &self.ffprobe_path)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

fn default_yt_dlp_path() -> PathBuf {
    PathBuf::from("yt-dlp")
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            downloads_directory: default_downloads_directory(),
            auth_token: None,
            skip_certificate_check: false,
            yt_dlp_path: default_yt_dlp_path(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl AppSettings {
    /// Load settings from the default location, creating defaults on first run.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&settings_file_path())
    }

    /// Load settings from `path`, creating defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Settings file not found, using defaults");
            let settings = Self::default();
            if let Err(e) = settings.save_to(path) {
                warn!("Failed to save default settings: {}", e);
            }
            return Ok(settings);
        }

        let content = fs::read_to_string(path).map_err(|e| {
            Error::FileSystem(FileSystemError::ReadFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to read settings file: {e}"),
            })
        })?;

        let mut settings: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse settings file: {e}")))?;
        settings.auth_token = normalize_token(settings.auth_token.as_deref());

        info!("Loaded settings from {}", path.display());
        debug!(
            downloads_directory = %settings.downloads_directory.display(),
            has_token = settings.auth_token.is_some(),
            "Effective settings"
        );
        Ok(settings)
    }

    /// Save settings to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&settings_file_path())
    }

    /// Save settings to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the file
    /// cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::FileSystem(FileSystemError::CreateDirFailed {
                    path: parent.to_path_buf(),
                    reason: format!("Failed to create settings directory: {e}"),
                })
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| {
            Error::FileSystem(FileSystemError::WriteFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to write settings file: {e}"),
            })
        })?;

        info!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Copy with the token masked, for display.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            auth_token: self.auth_token.as_ref().map(|_| "********".to_string()),
            ..self.clone()
        }
    }

    /// Get the path to the settings file.
    #[must_use]
    pub fn settings_file_path() -> PathBuf {
        settings_file_path()
    }
}

/// Trim a token; blank tokens become `None`.
#[must_use]
pub fn normalize_token(token: Option<&str>) -> Option<String> {
    token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
}

/// Get the default downloads directory.
#[must_use]
pub fn default_downloads_directory() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mediadrop")
}

fn settings_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("mediadrop")
        .join("settings.json")
}

/// Validate that a directory can receive downloads, creating it if missing.
///
/// # Errors
///
/// Returns a configuration error if the path is relative, is not a
/// directory, or is not writable.
pub fn validate_downloads_directory(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(Error::Configuration(
            "Downloads directory must be an absolute path".to_string(),
        ));
    }

    if path.exists() {
        if !path.is_dir() {
            return Err(Error::Configuration(format!(
                "Path exists but is not a directory: {}",
                path.display()
            )));
        }

        let probe = path.join(".mediadrop_write_test");
        match fs::write(&probe, "test") {
            Ok(()) => {
                let _ = fs::remove_file(&probe);
            }
            Err(e) => {
                return Err(Error::Configuration(format!(
                    "Directory is not writable: {} ({})",
                    path.display(),
                    e
                )));
            }
        }
    } else {
        fs::create_dir_all(path).map_err(|e| {
            Error::Configuration(format!("Cannot create directory {}: {}", path.display(), e))
        })?;
    }

    Ok(())
}

// =============================================================================
// Store
// =============================================================================

/// Process-wide settings holder, written on user edits.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: AppSettings,
}

impl SettingsStore {
    /// Load settings from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be loaded.
    pub fn open() -> Result<Self> {
        Self::open_at(settings_file_path())
    }

    /// Load settings from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be loaded.
    pub fn open_at(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = AppSettings::load_from(&path)?;
        Ok(Self { path, settings })
    }

    /// Current settings.
    #[must_use]
    pub const fn settings(&self) -> &AppSettings {
        &self.settings
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current token, if any.
    #[must_use]
    pub fn auth_token(&self) -> Option<&str> {
        self.settings.auth_token.as_deref()
    }

    /// Store a token; blank input clears it.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be saved.
    pub fn set_auth_token(&mut self, token: &str) -> Result<()> {
        self.settings.auth_token = normalize_token(Some(token));
        if self.settings.auth_token.is_some() {
            info!("Authentication token updated");
        } else {
            info!("Blank authentication token, clearing");
        }
        self.settings.save_to(&self.path)
    }

    /// Remove the token.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be saved.
    pub fn clear_auth_token(&mut self) -> Result<()> {
        self.settings.auth_token = None;
        info!("Authentication token cleared");
        self.settings.save_to(&self.path)
    }

    /// Change the downloads directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is invalid or settings cannot be saved.
    pub fn set_downloads_directory(&mut self, path: PathBuf) -> Result<()> {
        validate_downloads_directory(&path)?;
        self.settings.downloads_directory = path;
        info!(
            "Updated downloads directory to: {}",
            self.settings.downloads_directory.display()
        );
        self.settings.save_to(&self.path)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_timeout_defaults() {
        let t = TimeoutConfig::default();
        assert_eq!(t.download_budget(), Duration::from_secs(7200));
        assert_eq!(t.poll_interval(), Duration::from_secs(1));
        assert_eq!(t.merge_stable_polls, 3);
        assert_eq!(t.final_stable_polls, 2);
        assert_eq!(t.stuck_threshold(), Duration::from_secs(180));
    }

    #[test]
    fn test_post_processing_budget_by_size() {
        let t = TimeoutConfig::default();
        assert_eq!(t.post_processing_budget(10 * MIB), Duration::from_secs(600));
        assert_eq!(t.post_processing_budget(100 * MIB), Duration::from_secs(1800));
    }

    #[test]
    fn test_fallback_budget_by_size() {
        let t = TimeoutConfig::default();
        assert_eq!(t.fallback_budget(MIB), Duration::from_secs(15));
        assert_eq!(t.fallback_budget(50 * MIB), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"downloads_directory":"/custom","timeouts":{"poll_interval_ms":250}}"#;
        let settings: AppSettings = serde_json::from_str(json).expect("Should deserialize");
        assert_eq!(settings.downloads_directory, PathBuf::from("/custom"));
        assert_eq!(settings.timeouts.poll_interval(), Duration::from_millis(250));
        assert_eq!(settings.timeouts.merge_stable_polls, 3);
        assert!(!settings.skip_certificate_check);
        assert_eq!(settings.yt_dlp_path, PathBuf::from("yt-dlp"));
    }

    #[test]
    fn test_load_creates_defaults() {
        let temp_dir = TempDir::new().expect("Should create temp dir");
        let path = temp_dir.path().join("nested").join("settings.json");
        let settings = AppSettings::load_from(&path).expect("Should load");
        assert_eq!(settings, AppSettings::default());
        assert!(path.exists());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let temp_dir = TempDir::new().expect("Should create temp dir");
        let path = temp_dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        let err = AppSettings::load_from(&path).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_token_persistence() {
        let temp_dir = TempDir::new().expect("Should create temp dir");
        let path = temp_dir.path().join("settings.json");

        let mut store = SettingsStore::open_at(&path).unwrap();
        store.set_auth_token("  abc123  ").unwrap();
        assert_eq!(store.auth_token(), Some("abc123"));

        let reopened = SettingsStore::open_at(&path).unwrap();
        assert_eq!(reopened.auth_token(), Some("abc123"));

        let mut store = reopened;
        store.clear_auth_token().unwrap();
        let reopened = SettingsStore::open_at(&path).unwrap();
        assert_eq!(reopened.auth_token(), None);
    }

    #[test]
    fn test_blank_token_clears() {
        let temp_dir = TempDir::new().expect("Should create temp dir");
        let mut store = SettingsStore::open_at(temp_dir.path().join("s.json")).unwrap();
        store.set_auth_token("abc").unwrap();
        store.set_auth_token("   ").unwrap();
        assert_eq!(store.auth_token(), None);
    }

    #[test]
    fn test_token_is_redacted() {
        let settings = AppSettings {
            auth_token: Some("secret-value".to_string()),
            ..Default::default()
        };
        assert!(!format!("{settings:?}").contains("secret-value"));
        let redacted = serde_json::to_string(&settings.redacted()).unwrap();
        assert!(!redacted.contains("secret-value"));
    }

    #[test]
    fn test_validate_downloads_directory() {
        let temp_dir = TempDir::new().expect("Should create temp dir");
        assert!(validate_downloads_directory(temp_dir.path()).is_ok());

        let nested = temp_dir.path().join("a/b");
        assert!(validate_downloads_directory(&nested).is_ok());
        assert!(nested.is_dir());

        let file = temp_dir.path().join("file");
        fs::write(&file, "x").unwrap();
        let err = validate_downloads_directory(&file).unwrap_err();
        assert!(err.to_string().contains("not a directory"));

        let err = validate_downloads_directory(Path::new("relative")).unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn test_set_downloads_directory_persists() {
        let temp_dir = TempDir::new().expect("Should create temp dir");
        let mut store = SettingsStore::open_at(temp_dir.path().join("s.json")).unwrap();
        let downloads = temp_dir.path().join("downloads");
        store.set_downloads_directory(downloads.clone()).unwrap();

        let reopened = SettingsStore::open_at(store.path()).unwrap();
        assert_eq!(reopened.settings().downloads_directory, downloads);
    }

    #[test]
    fn test_settings_file_path_name() {
        let path = AppSettings::settings_file_path();
        assert!(path.ends_with("mediadrop/settings.json"));
    }
}
