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
use crate::config::{Credentials, Endpoints, USER_AGENT};
use log::debug;
use serde::Deserialize;
use std::time::Duration;

/// Token requests that stall longer than this fail instead of hanging the process.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Tokens returned by a successful authorization-code exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime of the access token in seconds, as reported by the provider.
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Talks to the provider's token endpoint on behalf of one OAuth client.
#[derive(Debug, Clone)]
pub struct TokenExchanger {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl TokenExchanger {
    pub fn new(credentials: &Credentials, endpoints: &Endpoints) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            token_url: endpoints.token_url.clone(),
            client_id: credentials.client_id.clone(),
            client_secret: credentials.client_secret.clone(),
        })
    }

    /// Trades a one-time authorization code for an access/refresh token pair.
    ///
    /// Both tokens must be present in the response; anything less is treated
    /// as a protocol violation and no partial result is returned.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenPair, AuthError> {
        let response = self
            .request_token(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .await?;

        let access_token = non_empty(response.access_token)
            .ok_or_else(|| AuthError::MalformedResponse("no access_token received".into()))?;
        let refresh_token = non_empty(response.refresh_token)
            .ok_or_else(|| AuthError::MalformedResponse("no refresh_token received".into()))?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: response.expires_in,
        })
    }

    /// Mints a fresh access token. Spotify may or may not rotate the refresh
    /// token here, so only the access token is returned.
    pub async fn refresh(&self, refresh_token: &str) -> Result<String, AuthError> {
        let response = self
            .request_token(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .await?;

        non_empty(response.access_token)
            .ok_or_else(|| AuthError::MalformedResponse("no access_token received".into()))
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        debug!("POST {} ({})", self.token_url, form[0].1);

        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status != reqwest::StatusCode::OK {
            return Err(AuthError::TokenExchangeFailed {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| AuthError::MalformedResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REDIRECT: &str = "http://127.0.0.1:8888/callback";

    fn exchanger(server: &MockServer) -> TokenExchanger {
        let creds = Credentials::new("abc", "xyz", REDIRECT);
        let endpoints = Endpoints {
            token_url: format!("{}/api/token", server.uri()),
            ..Default::default()
        };
        TokenExchanger::new(&creds, &endpoints).unwrap()
    }

    #[tokio::test]
    async fn test_exchange_code_returns_both_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            // base64("abc:xyz")
            .and(header("authorization", "Basic YWJjOnh5eg=="))
            .and(header("user-agent", USER_AGENT))
            .and(header_exists("content-type"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=AUTH123"))
            .and(body_string_contains(
                "redirect_uri=http%3A%2F%2F127.0.0.1%3A8888%2Fcallback",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "AT1",
                "refresh_token": "RT1",
                "expires_in": 3600,
                "token_type": "Bearer",
                "scope": "playlist-read-private"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let pair = exchanger(&server)
            .exchange_code("AUTH123", REDIRECT)
            .await
            .unwrap();

        assert_eq!(
            pair,
            TokenPair {
                access_token: "AT1".into(),
                refresh_token: "RT1".into(),
                expires_in: Some(3600),
            }
        );
    }

    #[tokio::test]
    async fn test_exchange_code_rejection_keeps_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"error":"invalid_grant","error_description":"Invalid authorization code"}"#),
            )
            .mount(&server)
            .await;

        let err = exchanger(&server)
            .exchange_code("stale", REDIRECT)
            .await
            .unwrap_err();

        match err {
            AuthError::TokenExchangeFailed { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(
                    body,
                    r#"{"error":"invalid_grant","error_description":"Invalid authorization code"}"#
                );
            }
            other => panic!("expected TokenExchangeFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_200_success_status_is_still_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(201).set_body_string("created?"))
            .mount(&server)
            .await;

        let err = exchanger(&server).refresh("RT1").await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::TokenExchangeFailed { status: 201, ref body } if body == "created?"
        ));
    }

    #[tokio::test]
    async fn test_exchange_code_missing_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "AT1",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let err = exchanger(&server)
            .exchange_code("AUTH123", REDIRECT)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_exchange_code_empty_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "",
                "refresh_token": "RT1"
            })))
            .mount(&server)
            .await;

        let err = exchanger(&server)
            .exchange_code("AUTH123", REDIRECT)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_undecodable_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = exchanger(&server)
            .exchange_code("AUTH123", REDIRECT)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_refresh_returns_access_token_only() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=RT1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "AT2",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = exchanger(&server).refresh("RT1").await.unwrap();
        assert_eq!(token, "AT2");
    }

    #[tokio::test]
    async fn test_refresh_without_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "refresh_token": "RT9"
            })))
            .mount(&server)
            .await;

        let err = exchanger(&server).refresh("RT1").await.unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_refresh_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
            .mount(&server)
            .await;

        let err = exchanger(&server).refresh("RT1").await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::TokenExchangeFailed { status: 401, ref body } if body == "invalid_client"
        ));
    }
}
