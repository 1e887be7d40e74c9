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

use crate::fs::atomic_write;
use log::debug;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_TOKEN_FILE: &str = ".token";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No refresh token stored at {0}")]
    NotFound(PathBuf),
    #[error("Refusing to store an empty refresh token")]
    InvalidInput,
    #[error("Token file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Persists the refresh token as a single line of text.
///
/// The access token is short-lived and never written to disk.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_FILE)
    }
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored token with surrounding whitespace trimmed.
    pub fn load(&self) -> Result<String, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.path.clone()))
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let token = contents.trim();
        if token.is_empty() {
            return Err(StoreError::NotFound(self.path.clone()));
        }
        Ok(token.to_string())
    }

    /// Replaces any previously stored token. Blank input leaves the file untouched.
    pub fn save(&self, token: &str) -> Result<(), StoreError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(StoreError::InvalidInput);
        }

        atomic_write(&self.path, format!("{}\n", token).as_bytes(), true).map_err(|source| {
            StoreError::Io {
                path: self.path.clone(),
                source,
            }
        })?;

        debug!("Refresh token written to {}", self.path.display());
        Ok(())
    }
}
