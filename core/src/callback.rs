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
use crate::config::CallbackAddress;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Html,
    routing::get,
    Router,
};
use log::{debug, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// How long in-flight callback requests get to finish once shutdown starts.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub const SUCCESS_PAGE: &str = "<html><body><h1>✓ Authorization successful!</h1>\
<p>You can close this window and return to the terminal.</p></body></html>";

pub const MISSING_CODE_PAGE: &str =
    "<html><body><h1>Error: No authorization code received</h1></body></html>";

/// What the listener observed: an authorization code, or why there is none.
pub type CallbackResult = Result<String, AuthError>;

/// Single-slot result channel. The first delivery wins; later ones are dropped
/// without blocking the caller.
#[derive(Clone)]
struct ResultSlot {
    sender: Arc<Mutex<Option<oneshot::Sender<CallbackResult>>>>,
}

impl ResultSlot {
    fn new() -> (Self, oneshot::Receiver<CallbackResult>) {
        let (tx, rx) = oneshot::channel();
        let slot = Self {
            sender: Arc::new(Mutex::new(Some(tx))),
        };
        (slot, rx)
    }

    async fn deliver(&self, result: CallbackResult) {
        let sender = self.sender.lock().await.take();
        match sender {
            Some(tx) => {
                if let Err(late) = tx.send(result) {
                    debug!("Callback result arrived after the flow ended: {:?}", late);
                }
            }
            None => debug!("Discarding extra callback signal: {:?}", result),
        }
    }
}

/// Short-lived HTTP listener that captures one authorization redirect.
///
/// Dropping the listener without calling [`CallbackListener::shutdown`]
/// aborts the serve task, so the port is never leaked.
pub struct CallbackListener {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl CallbackListener {
    /// Binds the address taken from the redirect URI and starts serving.
    ///
    /// Bind failures are returned immediately. Anything that goes wrong later
    /// in the serve loop is delivered through the returned receiver.
    ///
    /// A host name such as `localhost` is resolved and only the first address
    /// is bound. That may be `::1` while the browser connects to `127.0.0.1`,
    /// so redirect URIs should name an IP literal.
    pub async fn bind(
        address: &CallbackAddress,
    ) -> Result<(Self, oneshot::Receiver<CallbackResult>), AuthError> {
        let bind_addr = address.bind_addr();
        if !address.host_is_ip() {
            warn!(
                "Redirect host '{}' is not an IP address; the listener binds whichever address it resolves to first",
                address.host
            );
        }
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| AuthError::ListenerBind {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| AuthError::ListenerBind {
                addr: bind_addr.clone(),
                source,
            })?;

        let (slot, receiver) = ResultSlot::new();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let router = Router::new()
            .route(&address.path, get(handle_callback))
            .with_state(slot.clone());

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;

            if let Err(e) = served {
                slot.deliver(Err(AuthError::Listener(e.to_string()))).await;
            }
        });

        debug!("Callback listener bound on {}{}", local_addr, address.path);

        Ok((
            Self {
                local_addr,
                shutdown: Some(shutdown_tx),
                task,
            },
            receiver,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for the serve task to finish.
    ///
    /// The task is aborted if it has not finished within [`SHUTDOWN_GRACE`].
    /// Either way the port has been released when this returns.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task)
            .await
            .is_err()
        {
            warn!(
                "Callback listener on {} did not stop within {:?}, aborting",
                self.local_addr, SHUTDOWN_GRACE
            );
            self.task.abort();
            let _ = (&mut self.task).await;
        }

        debug!("Callback listener on {} shut down", self.local_addr);
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_callback(
    State(slot): State<ResultSlot>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Html<&'static str>) {
    match params.get("code").filter(|code| !code.is_empty()) {
        Some(code) => {
            slot.deliver(Ok(code.clone())).await;
            (StatusCode::OK, Html(SUCCESS_PAGE))
        }
        None => {
            let reason = params.get("error").cloned();
            slot.deliver(Err(AuthError::MissingCode { reason })).await;
            (StatusCode::BAD_REQUEST, Html(MISSING_CODE_PAGE))
        }
    }
}
