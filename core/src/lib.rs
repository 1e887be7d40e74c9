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

pub mod auth;
pub mod backup;
pub mod callback;
pub mod config;
pub mod exchange;
mod fs;
pub mod models;
pub mod server;
pub mod token_store;

// Re-export key items for convenience
pub use auth::{AuthError, Authorizer, BrowserLauncher, SystemBrowser};
pub use backup::{interactive_login, resolve_access_token, Backup, BackupError, TokenSource};
pub use config::{Credentials, Endpoints, Settings};
pub use exchange::{TokenExchanger, TokenPair};
pub use models::{BackupSummary, IndexEntry, SavedPlaylist};
pub use token_store::{StoreError, TokenStore};
