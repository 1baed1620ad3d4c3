//! OAuth2 authorization code + PKCE flow and token management for OneDrive.

use oauth2::basic::{BasicClient, BasicErrorResponseType};
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, CsrfToken, EndpointNotSet, EndpointSet,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, RequestTokenError, Scope,
    TokenResponse, TokenUrl,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::credentials::{Credential, CredentialStore};
use crate::provider::ConnectionStatus;
use safesync_common::{Error, Result};

/// Microsoft identity platform host.
const LOGIN_BASE: &str = "https://login.microsoftonline.com";
/// Microsoft Graph API base URL.
const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
/// Tenant used when settings name none (personal Microsoft accounts).
pub const DEFAULT_TENANT: &str = "consumers";

/// Delegated permissions requested during authorization.
const SCOPES: [&str; 3] = ["Files.Read", "User.Read", "offline_access"];

/// Access token lifetime assumed when the token endpoint reports none.
const DEFAULT_TOKEN_LIFETIME: std::time::Duration = std::time::Duration::from_secs(3600);

type GraphOAuthClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Remote endpoints used by the OneDrive backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Authority, e.g. `https://login.microsoftonline.com/consumers`.
    pub authority: String,
    /// Graph API base, e.g. `https://graph.microsoft.com/v1.0`.
    pub graph_base: String,
}

impl Endpoints {
    /// Production endpoints for a tenant.
    pub fn for_tenant(tenant: &str) -> Self {
        Self {
            authority: format!("{}/{}", LOGIN_BASE, tenant),
            graph_base: GRAPH_API_BASE.to_string(),
        }
    }

    /// Authorization endpoint.
    pub fn authorize_url(&self) -> String {
        format!("{}/oauth2/v2.0/authorize", self.authority.trim_end_matches('/'))
    }

    /// Token endpoint.
    pub fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority.trim_end_matches('/'))
    }
}

/// Configuration for OAuth2 authentication.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Application (client) id registered with Microsoft.
    pub client_id: String,
    /// Redirect URI registered for the application.
    pub redirect_url: String,
    pub endpoints: Endpoints,
}

/// OAuth2 client for the Microsoft identity platform.
///
/// Stateless: the caller persists the PKCE verifier and the resulting
/// credentials.
pub struct AuthManager {
    client: GraphOAuthClient,
    http: reqwest::Client,
    config: AuthConfig,
}

impl AuthManager {
    /// Create a new authentication manager.
    ///
    /// # Errors
    /// - Endpoint or redirect URL invalid
    /// - HTTP client cannot be built
    pub fn new(config: AuthConfig) -> Result<Self> {
        let client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_auth_type(AuthType::RequestBody)
            .set_auth_uri(
                AuthUrl::new(config.endpoints.authorize_url())
                    .map_err(|e| Error::Configuration(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(config.endpoints.token_url())
                    .map_err(|e| Error::Configuration(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(config.redirect_url.clone())
                    .map_err(|e| Error::Configuration(format!("Invalid redirect URL: {}", e)))?,
            );

        // Following redirects from the token endpoint would leak the code.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            http,
            config,
        })
    }

    /// Generate a fresh PKCE code verifier.
    pub fn new_code_verifier() -> String {
        let (_challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        verifier.secret().clone()
    }

    /// Build the authorization URL for a code verifier.
    ///
    /// The URL carries the S256 challenge of `code_verifier` and a random state.
    pub fn authorization_url(&self, code_verifier: &str) -> String {
        let verifier = PkceCodeVerifier::new(code_verifier.to_string());
        let challenge = PkceCodeChallenge::from_code_verifier_sha256(&verifier);

        let mut request = self
            .client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(challenge)
            .add_extra_param("response_mode", "query");
        for scope in SCOPES {
            request = request.add_scope(Scope::new(scope.to_string()));
        }

        let (url, _state) = request.url();
        url.to_string()
    }

    /// Exchange an authorization code for tokens.
    ///
    /// The returned credential carries no account details.
    ///
    /// # Errors
    /// - Code rejected by the token endpoint
    /// - No refresh token in the response
    /// - Network errors
    pub async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<Credential> {
        let token_result = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(code_verifier.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| match e {
                RequestTokenError::Request(e) => {
                    Error::Network(format!("Token exchange failed: {}", e))
                }
                e => Error::Authentication(format!("Token exchange failed: {}", e)),
            })?;

        let refresh_token = token_result
            .refresh_token()
            .ok_or_else(|| {
                Error::Authentication(
                    "No refresh token received. Ensure offline_access was granted.".to_string(),
                )
            })?
            .secret()
            .clone();

        Ok(Credential {
            access_token: token_result.access_token().secret().clone(),
            refresh_token,
            expires_at: Credential::expiry_from_now(
                token_result.expires_in().unwrap_or(DEFAULT_TOKEN_LIFETIME),
            ),
            account_name: String::new(),
            account_email: String::new(),
        })
    }

    /// Refresh an access token.
    ///
    /// The previous refresh token and account details are kept when the
    /// endpoint does not rotate them.
    ///
    /// # Errors
    /// - `ReauthRequired` when the refresh token was rejected (`invalid_grant`)
    /// - `Network` or `Authentication` on transient failures
    pub async fn refresh(&self, current: &Credential) -> Result<Credential> {
        let refresh_token = RefreshToken::new(current.refresh_token.clone());
        let mut request = self.client.exchange_refresh_token(&refresh_token);
        for scope in SCOPES {
            request = request.add_scope(Scope::new(scope.to_string()));
        }

        let token_result = request.request_async(&self.http).await.map_err(|e| match e {
            RequestTokenError::ServerResponse(response)
                if response.error() == &BasicErrorResponseType::InvalidGrant =>
            {
                Error::ReauthRequired(format!("Refresh token rejected: {}", response))
            }
            RequestTokenError::Request(e) => Error::Network(format!("Token refresh failed: {}", e)),
            e => Error::Authentication(format!("Token refresh failed: {}", e)),
        })?;

        let refresh_token = token_result
            .refresh_token()
            .map(|t| t.secret().clone())
            .unwrap_or_else(|| current.refresh_token.clone());

        Ok(Credential {
            access_token: token_result.access_token().secret().clone(),
            refresh_token,
            expires_at: Credential::expiry_from_now(
                token_result.expires_in().unwrap_or(DEFAULT_TOKEN_LIFETIME),
            ),
            account_name: current.account_name.clone(),
            account_email: current.account_email.clone(),
        })
    }

    /// Get the current configuration.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }
}

/// Hands out valid access tokens, refreshing and persisting them as needed.
///
/// Every read-check-refresh-write sequence runs under one mutex so concurrent
/// callers never race on a rotating refresh token.
pub struct TokenManager {
    auth_manager: AuthManager,
    store: Arc<dyn CredentialStore>,
    lock: Mutex<()>,
}

impl TokenManager {
    /// Create a token manager over a credential store.
    pub fn new(auth_manager: AuthManager, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            auth_manager,
            store,
            lock: Mutex::new(()),
        }
    }

    /// The underlying OAuth client.
    pub fn auth_manager(&self) -> &AuthManager {
        &self.auth_manager
    }

    async fn load_connected(&self) -> Result<Option<Credential>> {
        Ok(self.store.load().await?.filter(Credential::has_tokens))
    }

    /// Get a valid access token, refreshing if necessary.
    ///
    /// # Errors
    /// - `NotAuthenticated` when no credentials are stored
    /// - `ReauthRequired` when the credentials are corrupted or revoked
    /// - Transient refresh failures
    pub async fn access_token(&self) -> Result<String> {
        let _guard = self.lock.lock().await;

        let credential = self
            .load_connected()
            .await?
            .ok_or(Error::NotAuthenticated)?;

        if !credential.is_expired()? {
            return Ok(credential.access_token.clone());
        }

        info!("Refreshing expired access token");
        let refreshed = self.auth_manager.refresh(&credential).await?;
        self.store.store(&refreshed).await?;

        Ok(refreshed.access_token.clone())
    }

    /// Persist freshly exchanged credentials.
    pub async fn store(&self, credential: &Credential) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.store.store(credential).await
    }

    /// Delete stored credentials.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.store.delete().await
    }

    /// Derive the connection status from stored credentials.
    ///
    /// With `attempt_refresh` a token is also obtained, which refreshes it
    /// when expired. Only a rejected refresh token sets `needs_reauth`;
    /// transient failures are logged. Credentials are never deleted here.
    pub async fn status(&self, attempt_refresh: bool) -> Result<ConnectionStatus> {
        let credential = match self.store.load().await {
            Ok(Some(c)) if c.has_tokens() => c,
            Ok(_) => return Ok(ConnectionStatus::disconnected()),
            Err(e) => {
                warn!(error = %e, "Stored credentials unreadable");
                return Ok(ConnectionStatus::disconnected());
            }
        };

        if let Err(e) = credential.expiry() {
            warn!(error = %e, "Stored credentials corrupted");
            return Ok(ConnectionStatus {
                needs_reauth: true,
                ..ConnectionStatus::disconnected()
            });
        }

        let mut status = ConnectionStatus {
            connected: true,
            needs_reauth: false,
            account_name: non_empty(&credential.account_name),
            account_email: non_empty(&credential.account_email),
        };

        if attempt_refresh {
            match self.access_token().await {
                Ok(_) => {}
                Err(e) if e.is_reauth_required() => {
                    warn!(error = %e, "Reauthorization required");
                    status.needs_reauth = true;
                }
                Err(e) => {
                    warn!(error = %e, "Token refresh failed, keeping connection state");
                }
            }
        }

        Ok(status)
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
