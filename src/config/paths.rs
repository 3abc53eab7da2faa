//! Platform-specific data directory paths.
//!
//!   Windows: %APPDATA%/voicenote-viewer
//!   macOS:   ~/Library/Application Support/voicenote-viewer
//!   Linux:   $XDG_CONFIG_HOME/voicenote-viewer (default ~/.config)
//!
//! `VIEWER_DATA_DIR` overrides all of the above.

use std::path::PathBuf;

pub const DATA_DIR_ENV: &str = "VIEWER_DATA_DIR";

const APP_DIR: &str = "voicenote-viewer";

/// Get the viewer data directory (cross-platform).
pub fn get_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    get_config_base().join(APP_DIR)
}

/// Get the platform-appropriate base config directory.
fn get_config_base() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata);
        }
        dirs::config_dir().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("AppData")
                .join("Roaming")
        })
    }

    #[cfg(target_os = "macos")]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Library")
            .join("Application Support")
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
    }
}

/// Where downloads go when no directory is configured.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| get_data_dir().join("downloads"))
}
