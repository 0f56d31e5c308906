//! Runtime configuration
//!
//! Loaded from `chorus.toml`; every field has a default so an empty file
//! (or no file) is a valid configuration.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Who may invite new members into a group room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InvitePolicy {
    /// Only the owner may invite
    OwnerOnly,
    /// Any active member may invite, subject to the room's own setting
    #[default]
    AnyMember,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusConfig {
    /// Messages added to the window per load-older request
    pub page_size: usize,
    /// Minimum unread-from-others count before an unread marker is shown
    pub unread_marker_threshold: usize,
    /// Ceiling on concurrently active sub-managers per room
    pub max_sub_managers: usize,
    pub invite_policy: InvitePolicy,
    /// Capacity of each room's change broadcast
    pub event_buffer: usize,
}

impl Default for ChorusConfig {
    fn default() -> Self {
        Self {
            page_size: 30,
            unread_marker_threshold: 5,
            max_sub_managers: 3,
            invite_policy: InvitePolicy::AnyMember,
            event_buffer: 256,
        }
    }
}

impl ChorusConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: ChorusConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, falling back to defaults when the file is absent
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::invalid("page_size must be at least 1"));
        }
        if self.event_buffer == 0 {
            return Err(Error::invalid("event_buffer must be at least 1"));
        }
        Ok(())
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("app", "chorus", "chorus").ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine data directory",
            ))
        })
    }

    /// Per-user config file location
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("chorus.toml"))
    }

    /// Per-user database location
    pub fn default_db_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.data_dir().join("chorus.db"))
    }
}
