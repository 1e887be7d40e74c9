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

use crate::callback::{CallbackListener, CallbackResult};
use crate::config::{self, CallbackAddress, Credentials, Endpoints};
use crate::exchange::{TokenExchanger, TokenPair};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long the user gets to complete the consent screen.
pub const AUTHORIZATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Missing configuration: {0}")]
    ConfigurationMissing(String),
    #[error("Invalid redirect URI '{uri}': {reason}")]
    InvalidRedirectUri { uri: String, reason: String },
    #[error("Failed to bind callback listener on {addr}: {source}")]
    ListenerBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Callback listener failed: {0}")]
    Listener(String),
    #[error(
        "No authorization code in callback ({})",
        .reason.as_deref().unwrap_or("no code parameter")
    )]
    MissingCode { reason: Option<String> },
    #[error("Timed out after {0:?} waiting for authorization")]
    Timeout(Duration),
    #[error("Token exchange failed: {status} - {body}")]
    TokenExchangeFailed { status: u16, body: String },
    #[error("Malformed token response: {0}")]
    MalformedResponse(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Opens the authorization URL for the user.
///
/// Launching is best effort: an error only means the user has to open the
/// URL by hand, it never fails the flow.
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Hands the URL to the desktop's default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        open::that_detached(url)
    }
}

/// Progress of one interactive authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthState {
    Idle,
    AwaitingUserConsent,
    ExchangingCode,
    Complete,
    Failed,
}

/// Drives the interactive Authorization Code flow end to end.
///
/// Only one flow may run per redirect port at a time; a concurrent second
/// attempt fails with [`AuthError::ListenerBind`].
pub struct Authorizer {
    credentials: Credentials,
    endpoints: Endpoints,
    exchanger: TokenExchanger,
    browser: Arc<dyn BrowserLauncher>,
    timeout: Duration,
}

impl Authorizer {
    pub fn new(credentials: Credentials, endpoints: Endpoints) -> Result<Self, AuthError> {
        credentials.validate()?;
        let exchanger = TokenExchanger::new(&credentials, &endpoints)?;

        Ok(Self {
            credentials,
            endpoints,
            exchanger,
            browser: Arc::new(SystemBrowser),
            timeout: AUTHORIZATION_TIMEOUT,
        })
    }

    pub fn with_browser(mut self, browser: Arc<dyn BrowserLauncher>) -> Self {
        self.browser = browser;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn exchanger(&self) -> &TokenExchanger {
        &self.exchanger
    }

    pub fn authorize_url(&self) -> Result<String, AuthError> {
        config::authorize_url(&self.credentials, &self.endpoints)
    }

    /// Runs the whole flow and returns the resulting token pair.
    ///
    /// The callback listener is shut down exactly once on every exit path
    /// after it was bound: code received, callback error, or timeout.
    pub async fn authorize(&self) -> Result<TokenPair, AuthError> {
        self.authorize_tracked().await.1
    }

    /// Same as [`Authorizer::authorize`], also reporting the state the flow
    /// ended in. That is always `Complete` or `Failed`.
    pub(crate) async fn authorize_tracked(&self) -> (AuthState, Result<TokenPair, AuthError>) {
        let mut state = AuthState::Idle;
        let result = self.run(&mut state).await;

        let next = if result.is_ok() {
            AuthState::Complete
        } else {
            AuthState::Failed
        };
        transition(&mut state, next);
        (state, result)
    }

    async fn run(&self, state: &mut AuthState) -> Result<TokenPair, AuthError> {
        let address = CallbackAddress::parse(&self.credentials.redirect_uri)?;
        let url = self.authorize_url()?;

        let (listener, outcome) = CallbackListener::bind(&address).await?;
        transition(state, AuthState::AwaitingUserConsent);

        info!("Authorization URL: {}", url);
        if let Err(e) = self.browser.open(&url) {
            warn!("Could not open a browser ({}); the URL has to be opened manually", e);
        }

        let received = self.wait_for_callback(outcome).await;
        listener.shutdown().await;
        let code = received?;

        transition(state, AuthState::ExchangingCode);
        self.exchanger
            .exchange_code(&code, &self.credentials.redirect_uri)
            .await
    }

    async fn wait_for_callback(
        &self,
        outcome: tokio::sync::oneshot::Receiver<CallbackResult>,
    ) -> CallbackResult {
        match tokio::time::timeout(self.timeout, outcome).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AuthError::Listener(
                "callback listener stopped without a result".to_string(),
            )),
            Err(_) => Err(AuthError::Timeout(self.timeout)),
        }
    }
}

fn transition(state: &mut AuthState, next: AuthState) {
    debug!("Authorization state: {:?} -> {:?}", state, next);
    *state = next;
}
