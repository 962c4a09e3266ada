//! Bearer-token lifecycle for the client-credentials flow.
//!
//! One authentication call populates the token; a background task renews it
//! a slack interval before expiry. Renewal failure is fatal for the run: the
//! loop records the error and exits, and later `token()` calls fail.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::DumpError;

const RENEWAL_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Default)]
struct TokenState {
    token: Option<String>,
    expires_at: Option<Instant>,
    /// Set when a background renewal failed; poisons later `token()` calls.
    renewal_error: Option<String>,
}

struct RenewalHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    http: reqwest::Client,
    auth_uri: String,
    state: Mutex<TokenState>,
    renewal: Mutex<Option<RenewalHandle>>,
}

/// Shared credential manager; clones refer to the same token.
#[derive(Clone)]
pub struct Credentials {
    inner: Arc<Inner>,
}

impl Credentials {
    pub fn new(http: reqwest::Client, auth_uri: String) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                auth_uri,
                state: Mutex::new(TokenState::default()),
                renewal: Mutex::new(None),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TokenState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn renewal(&self) -> MutexGuard<'_, Option<RenewalHandle>> {
        self.inner
            .renewal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Authenticate and schedule background renewal.
    ///
    /// A no-op when already started. Any failure surfaces as the single
    /// `CannotAuthenticate` condition; nothing is retried or rescheduled.
    pub async fn start(&self) -> Result<(), DumpError> {
        if self.renewal().is_some() {
            debug!("credential manager already started");
            return Ok(());
        }

        let response = authenticate(&self.inner.http, &self.inner.auth_uri).await?;
        let validity = Duration::from_secs(response.expires_in);
        info!("obtained bearer token, valid for {}s", response.expires_in);
        self.store(response);

        if validity > RENEWAL_SLACK {
            self.spawn_renewal(validity - RENEWAL_SLACK);
        } else {
            warn!("token validity too short to schedule renewal");
        }
        Ok(())
    }

    /// Cancel any pending renewal and drop the token. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.renewal().take() {
            handle.cancel.cancel();
            handle.task.abort();
        }
        let mut state = self.state();
        state.token = None;
        state.expires_at = None;
        state.renewal_error = None;
    }

    /// The current bearer token, if one is active and unexpired.
    pub fn token(&self) -> Result<String, DumpError> {
        let state = self.state();
        if state.renewal_error.is_some() {
            return Err(DumpError::Unauthenticated);
        }
        match (&state.token, state.expires_at) {
            (Some(token), Some(expires_at)) if Instant::now() < expires_at => Ok(token.clone()),
            _ => Err(DumpError::Unauthenticated),
        }
    }

    fn store(&self, response: TokenResponse) {
        let mut state = self.state();
        state.token = Some(response.access_token);
        state.expires_at = Some(Instant::now() + Duration::from_secs(response.expires_in));
        state.renewal_error = None;
    }

    fn spawn_renewal(&self, first_wait: Duration) {
        let credentials = self.clone();
        let cancel = CancellationToken::new();
        let cancelled = cancel.clone();
        let task = tokio::spawn(async move {
            let mut wait = first_wait;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => {
                        debug!("token renewal cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
                match authenticate(&credentials.inner.http, &credentials.inner.auth_uri).await {
                    Ok(response) => {
                        let validity = Duration::from_secs(response.expires_in);
                        info!("renewed bearer token, valid for {}s", response.expires_in);
                        credentials.store(response);
                        if validity > RENEWAL_SLACK {
                            wait = validity - RENEWAL_SLACK;
                        } else {
                            warn!("renewed token validity too short to schedule renewal");
                            return;
                        }
                    }
                    Err(e) => {
                        error!("token renewal failed, no further renewals: {e}");
                        credentials.state().renewal_error = Some(e.to_string());
                        return;
                    }
                }
            }
        });
        *self.renewal() = Some(RenewalHandle { cancel, task });
    }
}

async fn authenticate(http: &reqwest::Client, uri: &str) -> Result<TokenResponse, DumpError> {
    let response = http
        .get(uri)
        .send()
        .await
        .map_err(|e| DumpError::CannotAuthenticate(e.to_string()))?;
    if !response.status().is_success() {
        return Err(DumpError::CannotAuthenticate(format!(
            "token endpoint returned {}",
            response.status()
        )));
    }
    let body = response
        .text()
        .await
        .map_err(|e| DumpError::CannotAuthenticate(e.to_string()))?;
    serde_json::from_str(&body)
        .map_err(|e| DumpError::CannotAuthenticate(format!("malformed token response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials_for(server: &MockServer) -> Credentials {
        Credentials::new(
            reqwest::Client::new(),
            format!(
                "{}/oauth/v2/token?grant_type=client_credentials&client_id=tester&client_secret=sec",
                server.uri()
            ),
        )
    }

    async fn mount_token(server: &MockServer, token: &str, expires_in: u64) {
        Mock::given(method("GET"))
            .and(path("/oauth/v2/token"))
            .and(query_param("grant_type", "client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": token,
                "expires_in": expires_in,
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn start_obtains_a_usable_token() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1", 3600).await;
        let credentials = credentials_for(&server);

        credentials.start().await.unwrap();
        assert_eq!(credentials.token().unwrap(), "tok-1");
        credentials.stop();
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1", 3600).await;
        let credentials = credentials_for(&server);

        credentials.start().await.unwrap();
        credentials.start().await.unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
        credentials.stop();
    }

    #[tokio::test]
    async fn stop_clears_the_token() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1", 3600).await;
        let credentials = credentials_for(&server);

        credentials.start().await.unwrap();
        credentials.stop();
        assert!(matches!(
            credentials.token(),
            Err(DumpError::Unauthenticated)
        ));
        // idempotent
        credentials.stop();
    }

    #[tokio::test]
    async fn expired_token_is_unauthenticated() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1", 0).await;
        let credentials = credentials_for(&server);

        credentials.start().await.unwrap();
        assert!(matches!(
            credentials.token(),
            Err(DumpError::Unauthenticated)
        ));
        credentials.stop();
    }

    #[tokio::test]
    async fn rejected_authentication_is_one_condition() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/v2/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let credentials = credentials_for(&server);

        assert!(matches!(
            credentials.start().await,
            Err(DumpError::CannotAuthenticate(_))
        ));
        assert!(matches!(
            credentials.token(),
            Err(DumpError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn malformed_token_body_is_one_condition() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/v2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;
        let credentials = credentials_for(&server);

        assert!(matches!(
            credentials.start().await,
            Err(DumpError::CannotAuthenticate(_))
        ));
    }

    #[tokio::test]
    async fn token_is_renewed_before_expiry() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-renewed", 2).await;
        let credentials = credentials_for(&server);

        credentials.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        // the renewal fired a slack second before the 2s expiry
        assert!(server.received_requests().await.unwrap().len() >= 2);
        assert_eq!(credentials.token().unwrap(), "tok-renewed");
        credentials.stop();
    }

    #[tokio::test]
    async fn failed_renewal_poisons_the_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/v2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok-1",
                "expires_in": 2,
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/oauth/v2/token"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let credentials = credentials_for(&server);

        credentials.start().await.unwrap();
        assert_eq!(credentials.token().unwrap(), "tok-1");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(matches!(
            credentials.token(),
            Err(DumpError::Unauthenticated)
        ));
        credentials.stop();
    }
}
