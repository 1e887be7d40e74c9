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

use crate::auth::{AuthError, Authorizer, BrowserLauncher};
use crate::config::{Settings, USER_AGENT};
use crate::exchange::{TokenExchanger, TokenPair, REQUEST_TIMEOUT};
use crate::fs::atomic_write;
use crate::models::{BackupSummary, IndexEntry, SavedPlaylist};
use crate::token_store::{StoreError, TokenStore};
use futures::stream::TryStreamExt;
use log::{debug, info, warn};
use rspotify::{
    model::{PlaylistItem, SimplifiedPlaylist},
    prelude::*,
    AuthCodeSpotify, Config, Credentials, OAuth, Token,
};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const INDEX_FILE: &str = "playlists-index.json";
pub const PLAYLISTS_DIR: &str = "playlists";
pub const IMAGES_DIR: &str = "images";

const MAX_FILENAME_LEN: usize = 200;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Spotify API error: {0}")]
    Spotify(#[from] rspotify::ClientError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Download of {url} failed with status {status}")]
    Download { url: String, status: u16 },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where the access token used for a backup came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// `SPOTIFY_ACCESS_TOKEN` was set directly.
    Environment,
    /// Minted from a refresh token taken from the environment or the token file.
    RefreshToken { from_store: bool },
    /// Obtained through the browser consent flow.
    Interactive { refresh_token_saved: bool },
}

#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub access_token: String,
    pub source: TokenSource,
}

/// Picks the cheapest way to an access token.
///
/// Order: a direct access token, then a refresh token (environment first,
/// token file second), then the interactive browser flow. Failing to persist
/// the new refresh token after an interactive login is only a warning.
pub async fn resolve_access_token(
    settings: &Settings,
    store: &TokenStore,
    browser: Arc<dyn BrowserLauncher>,
) -> Result<AccessGrant, BackupError> {
    if let Some(token) = &settings.access_token {
        return Ok(AccessGrant {
            access_token: token.clone(),
            source: TokenSource::Environment,
        });
    }

    let (refresh_token, from_store) = match &settings.refresh_token {
        Some(token) => (Some(token.clone()), false),
        None => match store.load() {
            Ok(token) => {
                info!("Loaded refresh token from {}", store.path().display());
                (Some(token), true)
            }
            Err(StoreError::NotFound(_)) => (None, false),
            Err(e) => {
                warn!("Ignoring unreadable token file: {}", e);
                (None, false)
            }
        },
    };

    let credentials = settings.credentials()?;

    if let Some(refresh_token) = refresh_token {
        let exchanger = TokenExchanger::new(&credentials, &settings.endpoints)?;
        let access_token = exchanger.refresh(&refresh_token).await?;
        return Ok(AccessGrant {
            access_token,
            source: TokenSource::RefreshToken { from_store },
        });
    }

    info!("No tokens found, starting interactive authorization");
    let (pair, refresh_token_saved) = interactive_login(settings, store, browser).await?;
    Ok(AccessGrant {
        access_token: pair.access_token,
        source: TokenSource::Interactive {
            refresh_token_saved,
        },
    })
}

/// Runs the browser flow and persists the refresh token.
///
/// Returns the tokens and whether the refresh token reached the token file.
pub async fn interactive_login(
    settings: &Settings,
    store: &TokenStore,
    browser: Arc<dyn BrowserLauncher>,
) -> Result<(TokenPair, bool), BackupError> {
    let authorizer =
        Authorizer::new(settings.credentials()?, settings.endpoints.clone())?.with_browser(browser);
    let pair = authorizer.authorize().await?;

    let saved = match store.save(&pair.refresh_token) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to save refresh token: {}", e);
            false
        }
    };
    Ok((pair, saved))
}

/// Downloads every playlist of the current user into a directory tree.
pub struct Backup {
    spotify: AuthCodeSpotify,
    http: reqwest::Client,
}

impl Backup {
    pub fn new(access_token: &str) -> Result<Self, BackupError> {
        Self::with_config(access_token, Config::default())
    }

    /// Same as [`Backup::new`] with a custom rspotify config, e.g. another
    /// `api_base_url`. Token refreshing is always off: the caller resolves
    /// a fresh access token before each run.
    pub fn with_config(access_token: &str, config: Config) -> Result<Self, BackupError> {
        let lifetime = chrono::Duration::seconds(3600);
        let token = Token {
            access_token: access_token.to_string(),
            expires_in: lifetime,
            expires_at: Some(chrono::Utc::now() + lifetime),
            ..Default::default()
        };

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let config = Config {
            token_cached: false,
            token_refreshing: false,
            ..config
        };

        Ok(Self {
            spotify: AuthCodeSpotify::from_token_with_config(
                token,
                Credentials::default(),
                OAuth::default(),
                config,
            ),
            http,
        })
    }

    /// Writes one JSON file per playlist, its cover image, and the index.
    ///
    /// A playlist whose tracks cannot be fetched or written is skipped and
    /// recorded in the summary; the run carries on with the next one.
    pub async fn run(&self, out_dir: &Path) -> Result<BackupSummary, BackupError> {
        let playlists_dir = out_dir.join(PLAYLISTS_DIR);
        let images_dir = out_dir.join(IMAGES_DIR);
        for dir in [&playlists_dir, &images_dir] {
            std::fs::create_dir_all(dir).map_err(|source| BackupError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let playlists = self.fetch_playlists().await?;
        let mut summary = BackupSummary::new(out_dir);
        summary.playlists_found = playlists.len();
        let total = playlists.len();

        for (i, playlist) in playlists.into_iter().enumerate() {
            let id = playlist.id.id().to_string();
            info!(
                "[{}/{}] downloading playlist {:?} ({})",
                i + 1,
                total,
                playlist.name,
                id
            );

            let tracks = match self.fetch_tracks(&playlist).await {
                Ok(tracks) => tracks,
                Err(e) => {
                    warn!("Failed to fetch tracks for {}: {}", id, e);
                    summary.add_skipped(&id, &playlist.name, e);
                    continue;
                }
            };

            let saved = saved_playlist(&playlist, tracks);
            let file_name = safe_filename(&format!("{}-{}.json", saved.name, id));
            let file_path = playlists_dir.join(&file_name);
            if let Err(e) = write_json(&file_path, &saved) {
                warn!("Failed to write playlist file {}: {}", file_path.display(), e);
                summary.add_skipped(&id, &saved.name, e);
                continue;
            }

            let mut entry = IndexEntry {
                id: id.clone(),
                name: saved.name.clone(),
                file: format!("{}/{}", PLAYLISTS_DIR, file_name),
                image_file: None,
            };

            if let Some(image_url) = &saved.image {
                let image_name =
                    safe_filename(&format!("playlist-{}{}", id, image_extension(image_url)));
                match self.download(image_url, &images_dir.join(&image_name)).await {
                    Ok(()) => entry.image_file = Some(format!("{}/{}", IMAGES_DIR, image_name)),
                    Err(e) => {
                        debug!("Cover image for {} not saved: {}", id, e);
                        summary.images_failed += 1;
                    }
                }
            }

            summary.index.push(entry);
        }

        write_json(&out_dir.join(INDEX_FILE), &summary.index)?;
        Ok(summary)
    }

    async fn fetch_playlists(&self) -> Result<Vec<SimplifiedPlaylist>, BackupError> {
        let mut playlists = Vec::new();
        let mut stream = self.spotify.current_user_playlists();

        while let Some(playlist) = stream.try_next().await? {
            playlists.push(playlist);
        }

        Ok(playlists)
    }

    async fn fetch_tracks(
        &self,
        playlist: &SimplifiedPlaylist,
    ) -> Result<Vec<PlaylistItem>, BackupError> {
        let mut tracks = Vec::with_capacity(playlist.tracks.total as usize);
        let mut stream = self.spotify.playlist_items(playlist.id.clone(), None, None);

        while let Some(item) = stream.try_next().await? {
            tracks.push(item);
        }

        Ok(tracks)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), BackupError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(BackupError::Download {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        atomic_write(dest, &bytes, false).map_err(|source| BackupError::Io {
            path: dest.to_path_buf(),
            source,
        })
    }
}

fn saved_playlist(playlist: &SimplifiedPlaylist, tracks: Vec<PlaylistItem>) -> SavedPlaylist {
    let id = playlist.id.id().to_string();
    SavedPlaylist {
        source_url: SavedPlaylist::source_url_for(&id),
        id,
        name: playlist.name.clone(),
        owner: playlist
            .owner
            .display_name
            .clone()
            .unwrap_or_else(|| playlist.owner.id.id().to_string()),
        image: playlist
            .images
            .first()
            .map(|image| image.url.clone())
            .filter(|url| !url.is_empty()),
        public: playlist.public,
        collaborative: playlist.collaborative,
        snapshot_id: playlist.snapshot_id.clone(),
        tracks_total: playlist.tracks.total,
        tracks,
    }
}

/// Pretty-prints `value` and atomically replaces `path` with it.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), BackupError> {
    let mut data = serde_json::to_vec_pretty(value)?;
    data.push(b'\n');
    atomic_write(path, &data, false).map_err(|source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Makes a playlist name usable as a file name on every platform.
///
/// Runs of characters other than ASCII letters, digits, `_`, `-`, `.` and
/// space collapse into a single `_`. The result is capped at 200 bytes.
pub fn safe_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;

    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' ') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }

    // Only ASCII survives, so any byte index is a char boundary.
    out.truncate(MAX_FILENAME_LEN);
    out
}

/// File extension for a cover image, `.jpg` unless the URL path has a short one.
pub fn image_extension(image_url: &str) -> String {
    url::Url::parse(image_url)
        .ok()
        .and_then(|url| {
            Path::new(url.path())
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy()))
        })
        .filter(|ext| ext.len() <= 5)
        .unwrap_or_else(|| ".jpg".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoints, ENV_ACCESS_TOKEN, ENV_CLIENT_ID, ENV_CLIENT_SECRET};
    use serde_json::{json, Value};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct PanickingBrowser;

    impl BrowserLauncher for PanickingBrowser {
        fn open(&self, url: &str) -> io::Result<()> {
            panic!("interactive flow should not start, got {}", url);
        }
    }

    /// Follows the consent redirect straight back with a fixed code.
    struct ApprovingBrowser {
        redirect_uri: String,
    }

    impl BrowserLauncher for ApprovingBrowser {
        fn open(&self, _url: &str) -> io::Result<()> {
            let callback = format!("{}?code=AUTH123", self.redirect_uri);
            tokio::spawn(async move {
                let _ = reqwest::get(callback).await;
            });
            Ok(())
        }
    }

    fn settings_for(server: &MockServer) -> Settings {
        Settings {
            client_id: Some("abc".to_string()),
            client_secret: Some("xyz".to_string()),
            endpoints: Endpoints {
                authorize_url: format!("{}/authorize", server.uri()),
                token_url: format!("{}/api/token", server.uri()),
            },
            ..Settings::from_lookup(|_| None)
        }
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("  Chill Vibes  "), "Chill Vibes");
        assert_eq!(safe_filename("AC/DC: Best-Of.json"), "AC_DC_ Best-Of.json");
        assert_eq!(safe_filename("Ñandú ❤️❤️ mix"), "_and_ _ mix");
        assert_eq!(safe_filename("a//\\\\b"), "a_b");
        assert_eq!(safe_filename(&"x".repeat(300)).len(), 200);
    }

    #[test]
    fn test_image_extension() {
        assert_eq!(image_extension("https://i.scdn.co/image/ab67616d0000b273"), ".jpg");
        assert_eq!(image_extension("https://example.com/cover.png"), ".png");
        assert_eq!(image_extension("https://example.com/cover.jpeg?size=640"), ".jpeg");
        assert_eq!(image_extension("https://example.com/cover.toolong"), ".jpg");
        assert_eq!(image_extension("not a url"), ".jpg");
    }

    #[test]
    fn test_write_json_is_pretty_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE);
        let index = vec![IndexEntry {
            id: "a".to_string(),
            name: "A".to_string(),
            file: "playlists/A-a.json".to_string(),
            image_file: None,
        }];

        write_json(&path, &index).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("[\n  {"));
        assert!(text.ends_with("]\n"));
        let parsed: Vec<IndexEntry> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, index);
    }

    fn playlist_json(server: &MockServer, id: &str, name: &str, image: Option<&str>) -> Value {
        let images = match image {
            Some(file) => json!([{"url": format!("{}/covers/{}", server.uri(), file), "height": 640, "width": 640}]),
            None => json!([]),
        };
        json!({
            "collaborative": false,
            "description": "",
            "external_urls": {"spotify": format!("https://open.spotify.com/playlist/{}", id)},
            "href": format!("{}/v1/playlists/{}", server.uri(), id),
            "id": id,
            "images": images,
            "name": name,
            "owner": {
                "display_name": "Alice",
                "external_urls": {"spotify": "https://open.spotify.com/user/alice"},
                "href": "https://api.spotify.com/v1/users/alice",
                "id": "alice",
                "images": [],
                "type": "user",
                "uri": "spotify:user:alice"
            },
            "primary_color": null,
            "public": true,
            "snapshot_id": format!("snap-{}", id),
            "tracks": {"href": format!("{}/v1/playlists/{}/tracks", server.uri(), id), "total": 1},
            "type": "playlist",
            "uri": format!("spotify:playlist:{}", id)
        })
    }

    fn page(items: Vec<Value>, limit: u32) -> Value {
        let total = items.len();
        json!({
            "href": "https://api.spotify.com/v1/page",
            "items": items,
            "limit": limit,
            "next": null,
            "offset": 0,
            "previous": null,
            "total": total
        })
    }

    #[tokio::test]
    async fn test_run_writes_playlists_covers_and_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/me/playlists"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(
                vec![
                    playlist_json(&server, "good1", "Road Trip", Some("good.png")),
                    playlist_json(&server, "broken1", "Broken", None),
                    playlist_json(&server, "nocover1", "No Cover", Some("missing.jpg")),
                ],
                50,
            )))
            .mount(&server)
            .await;

        let item = json!({
            "added_at": null,
            "added_by": null,
            "is_local": false,
            "track": null
        });
        for id in ["good1", "nocover1"] {
            Mock::given(method("GET"))
                .and(path(format!("/v1/playlists/{}/tracks", id)))
                .respond_with(ResponseTemplate::new(200).set_body_json(page(vec![item.clone()], 100)))
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/v1/playlists/broken1/tracks"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/covers/good.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PNGDATA".to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/covers/missing.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let config = Config {
            api_base_url: format!("{}/v1/", server.uri()),
            ..Default::default()
        };
        let backup = Backup::with_config("AT1", config).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let summary = backup.run(dir.path()).await.unwrap();

        assert_eq!(summary.playlists_found, 3);
        assert_eq!(summary.saved(), 2);
        assert_eq!(summary.images_failed, 1);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].id, "broken1");

        let saved: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("playlists/Road Trip-good1.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(saved["name"], "Road Trip");
        assert_eq!(saved["owner"], "Alice");
        assert_eq!(saved["tracks_total"], 1);
        assert_eq!(saved["tracks"].as_array().unwrap().len(), 1);
        assert_eq!(saved["source_url"], "https://open.spotify.com/playlist/good1");
        assert!(dir.path().join("playlists/No Cover-nocover1.json").exists());
        assert!(!dir.path().join("playlists/Broken-broken1.json").exists());
        assert_eq!(
            std::fs::read(dir.path().join("images/playlist-good1.png")).unwrap(),
            b"PNGDATA"
        );

        let index_text = std::fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        let index: Vec<IndexEntry> = serde_json::from_str(&index_text).unwrap();
        assert_eq!(
            index,
            vec![
                IndexEntry {
                    id: "good1".to_string(),
                    name: "Road Trip".to_string(),
                    file: "playlists/Road Trip-good1.json".to_string(),
                    image_file: Some("images/playlist-good1.png".to_string()),
                },
                IndexEntry {
                    id: "nocover1".to_string(),
                    name: "No Cover".to_string(),
                    file: "playlists/No Cover-nocover1.json".to_string(),
                    image_file: None,
                },
            ]
        );
        let raw: Value = serde_json::from_str(&index_text).unwrap();
        assert!(raw[1].get("imageFile").is_none());
    }

    #[tokio::test]
    async fn test_direct_access_token_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join(".token"));
        store.save("stored").unwrap();
        let settings = Settings::from_lookup(|key| {
            (key == ENV_ACCESS_TOKEN).then(|| "AT-env".to_string())
        });

        let grant = resolve_access_token(&settings, &store, Arc::new(PanickingBrowser))
            .await
            .unwrap();

        assert_eq!(grant.access_token, "AT-env");
        assert_eq!(grant.source, TokenSource::Environment);
    }

    #[tokio::test]
    async fn test_stored_refresh_token_is_used() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .and(body_string_contains("refresh_token=stored-rt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "AT-refreshed",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join(".token"));
        store.save("stored-rt").unwrap();

        let grant = resolve_access_token(&settings_for(&server), &store, Arc::new(PanickingBrowser))
            .await
            .unwrap();

        assert_eq!(grant.access_token, "AT-refreshed");
        assert_eq!(grant.source, TokenSource::RefreshToken { from_store: true });
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join(".token"));
        let settings = Settings {
            refresh_token: Some("revoked".to_string()),
            ..settings_for(&server)
        };

        let err = resolve_access_token(&settings, &store, Arc::new(PanickingBrowser))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BackupError::Auth(AuthError::TokenExchangeFailed { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn test_interactive_login_persists_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "AT1",
                "refresh_token": "RT1",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let port = crate::callback::tests::free_port();
        let redirect_uri = format!("http://127.0.0.1:{}/callback", port);
        let settings = Settings {
            redirect_uri: redirect_uri.clone(),
            ..settings_for(&server)
        };
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join(".token"));

        let grant = resolve_access_token(
            &settings,
            &store,
            Arc::new(ApprovingBrowser { redirect_uri }),
        )
        .await
        .unwrap();

        assert_eq!(grant.access_token, "AT1");
        assert_eq!(
            grant.source,
            TokenSource::Interactive {
                refresh_token_saved: true
            }
        );
        assert_eq!(store.load().unwrap(), "RT1");
    }

    #[tokio::test]
    async fn test_nothing_configured() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join(".token"));
        let settings = Settings::from_lookup(|key| {
            (key == ENV_CLIENT_SECRET).then(|| "xyz".to_string())
        });

        let err = resolve_access_token(&settings, &store, Arc::new(PanickingBrowser))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BackupError::Auth(AuthError::ConfigurationMissing(ref name)) if name == ENV_CLIENT_ID
        ));
    }
}
