/*
    spotify-backup-rs | Rust CLI tool to back up Spotify playlists to JSON.
    Copyright (C) 2025  Israel Alberto Roldan Vega

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use rspotify::model::PlaylistItem;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One playlist as written to `playlists/<name>-<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedPlaylist {
    pub id: String,
    pub name: String,
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub public: Option<bool>,
    pub collaborative: bool,
    pub snapshot_id: String,
    pub tracks_total: u32,
    pub tracks: Vec<PlaylistItem>,
    pub source_url: String,
}

impl SavedPlaylist {
    pub fn source_url_for(id: &str) -> String {
        format!("https://open.spotify.com/playlist/{}", id)
    }
}

/// Entry of the top-level `playlists-index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub name: String,
    /// Path of the playlist file, relative to the output directory.
    pub file: String,
    #[serde(rename = "imageFile", skip_serializing_if = "Option::is_none")]
    pub image_file: Option<String>,
}

/// A playlist the backup had to skip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedPlaylist {
    pub id: String,
    pub name: String,
    pub reason: String,
}

impl fmt::Display for SkippedPlaylist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" ({}): {}", self.name, self.id, self.reason)
    }
}

/// Outcome of one backup run.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BackupSummary {
    pub out_dir: PathBuf,
    pub playlists_found: usize,
    pub index: Vec<IndexEntry>,
    pub skipped: Vec<SkippedPlaylist>,
    pub images_failed: usize,
}

impl BackupSummary {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            ..Default::default()
        }
    }

    pub fn saved(&self) -> usize {
        self.index.len()
    }

    pub fn add_skipped(&mut self, id: &str, name: &str, reason: impl fmt::Display) {
        self.skipped.push(SkippedPlaylist {
            id: id.to_string(),
            name: name.to_string(),
            reason: reason.to_string(),
        });
    }
}
