use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use meshroom_core::{MAX_DISPLAY_NAME_LEN, RoomId};
use meshroom_session::{BanList, SessionConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `profile.json` only holds a name, an avatar and ban lists; anything
/// bigger than this is treated as corrupt.
pub const MAX_PROFILE_BYTES: u64 = 256 * 1024;

pub const DEFAULT_DISPLAY_NAME: &str = "anonymous";

fn default_notifications() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedProfile {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default = "default_notifications")]
    pub notifications: bool,
    /// Ban lists keyed by room code.
    #[serde(default)]
    pub bans: HashMap<RoomId, BanList>,
}

impl Default for SavedProfile {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            avatar: None,
            notifications: default_notifications(),
            bans: HashMap::new(),
        }
    }
}

impl SavedProfile {
    pub fn effective_name(&self) -> &str {
        if self.display_name.trim().is_empty() {
            DEFAULT_DISPLAY_NAME
        } else {
            &self.display_name
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            avatar: self.avatar.clone(),
            bans: self.bans.clone(),
            ..SessionConfig::new(self.effective_name())
        }
    }

    /// Stores the latest ban list of `room_code`; empty lists are dropped.
    pub fn record_bans(&mut self, room_code: &str, bans: BanList) {
        if bans.is_empty() {
            self.bans.remove(room_code);
        } else {
            self.bans.insert(room_code.to_owned(), bans);
        }
    }

    pub fn unban(&mut self, room_code: &str, name: &str) -> bool {
        let Some(list) = self.bans.get_mut(room_code) else {
            return false;
        };
        let removed = list.remove(name).is_some();
        if list.is_empty() {
            self.bans.remove(room_code);
        }
        removed
    }
}

/// Trims `input` and cuts it to [`MAX_DISPLAY_NAME_LEN`] characters.
/// Returns `None` when nothing is left.
pub fn normalize_display_name(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_DISPLAY_NAME_LEN).collect())
}

#[derive(Debug, Error)]
pub enum ProfileLoadError {
    #[error("cannot stat profile {}: {source}", .path.display())]
    Metadata { path: PathBuf, source: io::Error },
    #[error("profile too large: {size} bytes (max {MAX_PROFILE_BYTES})")]
    TooLarge { size: u64 },
    #[error("profile read failed: {0}")]
    Read(#[source] io::Error),
    #[error("profile parse failed: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ProfileSaveError {
    #[error("cannot create profile directory {}: {source}", .dir.display())]
    CreateDir { dir: PathBuf, source: io::Error },
    #[error("profile serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("writing {} failed: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// `$MESHROOM_DATA_DIR/profile.json`, falling back to the platform's local
/// data directory and finally the working directory.
pub fn profile_path() -> PathBuf {
    let base = std::env::var_os("MESHROOM_DATA_DIR")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("LOCALAPPDATA").map(|dir| PathBuf::from(dir).join("Meshroom"))
        })
        .or_else(|| std::env::var_os("HOME").map(|dir| PathBuf::from(dir).join(".meshroom")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("profile.json")
}

pub fn parse_profile_json(data: &str) -> Result<SavedProfile, serde_json::Error> {
    serde_json::from_str::<SavedProfile>(data)
}

pub fn load_profile_from_path(path: &Path) -> Result<SavedProfile, ProfileLoadError> {
    let meta = fs::metadata(path).map_err(|source| ProfileLoadError::Metadata {
        path: path.to_owned(),
        source,
    })?;
    if meta.len() > MAX_PROFILE_BYTES {
        return Err(ProfileLoadError::TooLarge { size: meta.len() });
    }

    let data = fs::read_to_string(path).map_err(ProfileLoadError::Read)?;
    Ok(parse_profile_json(&data)?)
}

/// Loads the profile at `path`, or the default when it is missing or unreadable.
pub fn load_profile(path: &Path) -> SavedProfile {
    match load_profile_from_path(path) {
        Ok(profile) => profile,
        Err(ProfileLoadError::Metadata { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            SavedProfile::default()
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), "ignoring saved profile: {}", err);
            SavedProfile::default()
        }
    }
}

pub fn save_profile_to_path(path: &Path, profile: &SavedProfile) -> Result<(), ProfileSaveError> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|source| ProfileSaveError::CreateDir {
            dir: dir.to_owned(),
            source,
        })?;
    }
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(profile)?;
    fs::write(&tmp, payload.as_bytes()).map_err(|source| ProfileSaveError::Write {
        path: tmp.clone(),
        source,
    })?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(|source| ProfileSaveError::Write {
        path: path.to_owned(),
        source,
    })
}

pub fn save_profile_with_retry(path: &Path, profile: &SavedProfile) -> Result<(), ProfileSaveError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt = 1;
    loop {
        match save_profile_to_path(path, profile) {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(err) => {
                tracing::debug!(attempt, "profile save failed, retrying: {}", err);
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}
