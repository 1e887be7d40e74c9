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

use crate::auth::AuthError;
use std::net::IpAddr;
use url::Url;

pub const ENV_ACCESS_TOKEN: &str = "SPOTIFY_ACCESS_TOKEN";
pub const ENV_REFRESH_TOKEN: &str = "SPOTIFY_REFRESH_TOKEN";
pub const ENV_CLIENT_ID: &str = "SPOTIFY_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "SPOTIFY_CLIENT_SECRET";
pub const ENV_REDIRECT_URI: &str = "SPOTIFY_REDIRECT_URI";

pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8888/callback";
pub const DEFAULT_CALLBACK_PORT: u16 = 8888;

/// Identifies every request this tool makes to Spotify.
pub const USER_AGENT: &str = "spotify-backup/1.0";

/// Read-only access to playlists and the library is all a backup needs.
pub const SCOPES: &[&str] = &[
    "playlist-read-private",
    "playlist-read-collaborative",
    "user-library-read",
];

/// OAuth client credentials registered in the Spotify developer dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl Credentials {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
        }
    }

    /// Reads `SPOTIFY_CLIENT_ID`, `SPOTIFY_CLIENT_SECRET` and `SPOTIFY_REDIRECT_URI`.
    pub fn from_env() -> Result<Self, AuthError> {
        Settings::from_env().credentials()
    }

    /// Fails with [`AuthError::ConfigurationMissing`] when the id or secret is blank.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.client_id.trim().is_empty() {
            return Err(AuthError::ConfigurationMissing(ENV_CLIENT_ID.to_string()));
        }
        if self.client_secret.trim().is_empty() {
            return Err(AuthError::ConfigurationMissing(
                ENV_CLIENT_SECRET.to_string(),
            ));
        }
        if self.redirect_uri.trim().is_empty() {
            return Err(AuthError::ConfigurationMissing(ENV_REDIRECT_URI.to_string()));
        }
        Ok(())
    }
}

/// Provider URLs. Overridable so tests can point the client at a mock server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub authorize_url: String,
    pub token_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            authorize_url: "https://accounts.spotify.com/authorize".to_string(),
            token_url: "https://accounts.spotify.com/api/token".to_string(),
        }
    }
}

/// Everything the tool can pick up from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub endpoints: Endpoints,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Self {
            access_token: get(ENV_ACCESS_TOKEN),
            refresh_token: get(ENV_REFRESH_TOKEN),
            client_id: get(ENV_CLIENT_ID),
            client_secret: get(ENV_CLIENT_SECRET),
            redirect_uri: get(ENV_REDIRECT_URI)
                .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string()),
            endpoints: Endpoints::default(),
        }
    }

    pub fn has_client_credentials(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }

    pub fn credentials(&self) -> Result<Credentials, AuthError> {
        let client_id = self
            .client_id
            .clone()
            .ok_or_else(|| AuthError::ConfigurationMissing(ENV_CLIENT_ID.to_string()))?;
        let client_secret = self
            .client_secret
            .clone()
            .ok_or_else(|| AuthError::ConfigurationMissing(ENV_CLIENT_SECRET.to_string()))?;

        Ok(Credentials::new(
            client_id,
            client_secret,
            self.redirect_uri.clone(),
        ))
    }
}

/// Where the local callback listener has to bind, derived from the redirect URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackAddress {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl CallbackAddress {
    pub fn parse(redirect_uri: &str) -> Result<Self, AuthError> {
        let url = Url::parse(redirect_uri).map_err(|e| AuthError::InvalidRedirectUri {
            uri: redirect_uri.to_string(),
            reason: e.to_string(),
        })?;

        let host = url
            .host_str()
            .ok_or_else(|| AuthError::InvalidRedirectUri {
                uri: redirect_uri.to_string(),
                reason: "no host".to_string(),
            })?
            .to_string();

        let path = match url.path() {
            "" | "/" => "/callback".to_string(),
            path => path.to_string(),
        };

        Ok(Self {
            host,
            port: url
                .port()
                .or_else(|| explicit_port(redirect_uri))
                .unwrap_or(DEFAULT_CALLBACK_PORT),
            path,
        })
    }

    /// `host:port`, suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether the host is an IP literal rather than a name to resolve.
    pub fn host_is_ip(&self) -> bool {
        self.host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok()
    }
}

/// Port written in the authority of `uri`, even when it is the scheme default.
///
/// `Url::port` normalizes `http://host:80` to no port at all, but the
/// provider still redirects to `:80`, so the listener has to bind it.
fn explicit_port(uri: &str) -> Option<u16> {
    let rest = uri.split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    let (host, port) = host_port.rsplit_once(':')?;
    if host.starts_with('[') && !host.ends_with(']') {
        // Colon inside an IPv6 literal without a port.
        return None;
    }
    port.parse().ok()
}

/// Builds the consent page URL the user has to visit.
pub fn authorize_url(credentials: &Credentials, endpoints: &Endpoints) -> Result<String, AuthError> {
    let scope = SCOPES.join(" ");
    let url = Url::parse_with_params(
        &endpoints.authorize_url,
        &[
            ("client_id", credentials.client_id.as_str()),
            ("response_type", "code"),
            ("redirect_uri", credentials.redirect_uri.as_str()),
            ("scope", scope.as_str()),
        ],
    )
    .map_err(|e| AuthError::ConfigurationMissing(format!("authorize endpoint: {}", e)))?;

    Ok(url.into())
}
