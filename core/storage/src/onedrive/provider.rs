//! OneDrive storage provider implementation.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use safesync_common::Result;

use super::auth::{AuthConfig, AuthManager, TokenManager};
use super::client::GraphClient;
use super::PROVIDER_ID;
use crate::credentials::{CredentialStore, FileCredentialStore, VerifierStore};
use crate::provider::{ConnectionStatus, Download, RemoteFile, RemoteStorageProvider};

const BRAND_COLOR: &str = "#0078D4";

const ICON: &str = "data:image/svg+xml;base64,PHN2ZyB4bWxucz0iaHR0cDovL3d3dy53My5vcmcvMjAwMC9zdmciIHZpZXdCb3g9IjAgNS41IDMyIDIwLjUiPjxnPjxwYXRoIGQ9Ik0xMi4yIDExLjJsNi43IDQgNC0xLjdBNi41IDYuNSAwIDAgMSAyNS41IDEzYy4xIDAgLjMgMCAuNCAwYTEwIDEwIDAgMCAwLTE4LTNDNy45IDEwIDggMTAgOCAxMGE4IDggMCAwIDEgNC4yIDEuMnoiIGZpbGw9IiMwMzY0YjgiLz48cGF0aCBkPSJNMTIuMiAxMS4yQTggOCAwIDAgMCA4IDEwaC0uMUE4IDggMCAwIDAgMS40IDIyLjZsNS45LTIuNSAyLjYtMS4xIDUuOS0yLjUgMy4xLTEuM3oiIGZpbGw9IiMwMDc4ZDQiLz48cGF0aCBkPSJNMjUuOSAxM2gtLjRhNi41IDYuNSAwIDAgMC0yLjYuNWwtNCAxLjcgMS4yLjcgMy44IDIuMyAxLjcgMSA1LjcgMy40YTYuNSA2LjUgMCAwIDAtNS4zLTkuNnoiIGZpbGw9IiMxNDkwZGYiLz48cGF0aCBkPSJNMjUuNSAxOS4ybC0xLjYtMS0zLjgtMi4zLTEuMi0uNy0zIDEuMy01LjkgMi41LTIuNiAxLjEtNS45IDIuNUE4IDggMCAwIDAgOCAyNmgxNy41YTYuNSA2LjUgMCAwIDAgNS43LTMuNHoiIGZpbGw9IiMyOGE4ZWEiLz48L2c+PC9zdmc+";

/// OneDrive storage provider.
///
/// Credentials and the pending PKCE verifier live in the provider directory.
pub struct OneDriveProvider {
    dir: PathBuf,
    token_manager: Arc<TokenManager>,
    client: GraphClient,
    verifiers: VerifierStore,
}

impl OneDriveProvider {
    /// Create a provider storing its credentials in `dir`.
    ///
    /// Removes a stale code verifier left behind by an earlier run.
    pub fn new(dir: impl Into<PathBuf>, config: AuthConfig) -> Result<Self> {
        let dir = dir.into();
        let store = Arc::new(FileCredentialStore::new(&dir));
        Self::with_store(dir, config, store)
    }

    /// Create a provider with a custom credential store.
    pub fn with_store(
        dir: impl Into<PathBuf>,
        config: AuthConfig,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        let dir = dir.into();
        let graph_base = config.endpoints.graph_base.clone();

        let token_manager = Arc::new(TokenManager::new(AuthManager::new(config)?, store));
        let client = GraphClient::new(graph_base, token_manager.clone())?;

        let verifiers = VerifierStore::new(&dir);
        verifiers.cleanup_stale();

        Ok(Self {
            dir,
            token_manager,
            client,
            verifiers,
        })
    }

    /// Provider directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl RemoteStorageProvider for OneDriveProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn display_name(&self) -> &str {
        "OneDrive"
    }

    fn icon(&self) -> &str {
        ICON
    }

    fn brand_color(&self) -> &str {
        BRAND_COLOR
    }

    async fn auth_url(&self) -> Result<String> {
        let verifier = AuthManager::new_code_verifier();
        self.verifiers.store(&verifier).await?;
        Ok(self
            .token_manager
            .auth_manager()
            .authorization_url(&verifier))
    }

    async fn handle_callback(&self, code: &str) -> Result<()> {
        let verifier = self.verifiers.load().await?;

        let mut credential = self
            .token_manager
            .auth_manager()
            .exchange_code(code, &verifier)
            .await?;

        match self.client.profile(&credential.access_token).await {
            Ok(profile) => {
                credential.account_email = profile.email();
                credential.account_name = profile.display_name.unwrap_or_default();
            }
            Err(e) => warn!(error = %e, "Failed to fetch OneDrive profile"),
        }

        self.token_manager.store(&credential).await?;
        self.verifiers.delete().await?;

        info!(account = %credential.account_email, "OneDrive connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let tokens = self.token_manager.clear().await;
        let verifier = self.verifiers.delete().await;
        tokens.and(verifier)?;
        info!("OneDrive disconnected");
        Ok(())
    }

    async fn connection_status(&self, attempt_refresh: bool) -> Result<ConnectionStatus> {
        self.token_manager.status(attempt_refresh).await
    }

    async fn list_remote_files(&self) -> Result<Vec<RemoteFile>> {
        self.client.search_safes().await
    }

    async fn download_file(&self, file_id: &str) -> Result<Download> {
        self.client.download_stream(file_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credential, TOKENS_FILE, VERIFIER_FILE};
    use crate::onedrive::auth::Endpoints;
    use axum::body::Body;
    use axum::extract::State;
    use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::{Json, Router};
    use futures::TryStreamExt;
    use safesync_common::Error;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    /// Local stand-in for the identity platform and Graph.
    struct Stub {
        base: String,
        revoked: AtomicBool,
        token_unavailable: AtomicBool,
        rotates_refresh_token: AtomicBool,
        foreign_next_link: AtomicBool,
        profile_fails: AtomicBool,
        token_requests: Mutex<Vec<HashMap<String, String>>>,
    }

    impl Stub {
        fn token_requests(&self) -> Vec<HashMap<String, String>> {
            self.token_requests.lock().unwrap().clone()
        }
    }

    fn invalid_grant() -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_grant", "error_description": "AADSTS70000"})),
        )
            .into_response()
    }

    fn token_response(access: &str, refresh: Option<&str>) -> Response {
        let mut body = json!({
            "access_token": access,
            "token_type": "Bearer",
            "expires_in": 3600,
            "scope": "Files.Read User.Read offline_access",
        });
        if let Some(refresh) = refresh {
            body["refresh_token"] = json!(refresh);
        }
        Json(body).into_response()
    }

    async fn handle(
        State(stub): State<Arc<Stub>>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: String,
    ) -> Response {
        let path = uri.path();

        if method == Method::POST && path == "/tenant/oauth2/v2.0/token" {
            let form: HashMap<String, String> = url::form_urlencoded::parse(body.as_bytes())
                .into_owned()
                .collect();
            stub.token_requests.lock().unwrap().push(form.clone());

            if stub.token_unavailable.load(Ordering::SeqCst) {
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
            return match form.get("grant_type").map(String::as_str) {
                Some("authorization_code")
                    if form.get("code").map(String::as_str) == Some("good-code")
                        && form.contains_key("code_verifier") =>
                {
                    token_response("access-1", Some("refresh-1"))
                }
                Some("refresh_token") if stub.rotates_refresh_token.load(Ordering::SeqCst) => {
                    // Slow enough for concurrent callers to overlap
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    if form.get("refresh_token").map(String::as_str) == Some("refresh-1") {
                        token_response("access-2", Some("refresh-2"))
                    } else {
                        invalid_grant()
                    }
                }
                Some("refresh_token") if !stub.revoked.load(Ordering::SeqCst) => {
                    token_response("access-2", None)
                }
                _ => invalid_grant(),
            };
        }

        let authorized = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("Bearer access-"));
        if !authorized {
            return StatusCode::UNAUTHORIZED.into_response();
        }

        if path == "/graph/me" {
            if stub.profile_fails.load(Ordering::SeqCst) {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            return Json(json!({
                "displayName": "Ada Lovelace",
                "mail": null,
                "userPrincipalName": "ada@outlook.com",
            }))
            .into_response();
        }

        if path.starts_with("/graph/me/drive/root/search") {
            let next = if stub.foreign_next_link.load(Ordering::SeqCst) {
                "https://attacker.example/graph/search-page-2".to_string()
            } else {
                format!("{}/graph/search-page-2", stub.base)
            };
            return Json(json!({
                "value": [
                    {
                        "id": "item-a",
                        "name": "a.psafe3",
                        "lastModifiedDateTime": "2024-05-01T10:00:00Z",
                        "parentReference": {"path": "/drive/root:/Documents"}
                    },
                    {
                        "id": "item-bak",
                        "name": "a.psafe3.bak",
                        "parentReference": {"path": "/drive/root:/Documents"}
                    }
                ],
                "@odata.nextLink": next,
            }))
            .into_response();
        }

        if path == "/graph/search-page-2" {
            return Json(json!({
                "value": [
                    {
                        "id": "item-b",
                        "name": "B.PSAFE3",
                        "parentReference": {"path": "/drive/root:"}
                    },
                    {
                        "id": "item-c",
                        "name": "c.psafe3",
                        "parentReference": {"path": "/drive/root:/Old%20Safes"}
                    }
                ]
            }))
            .into_response();
        }

        if path == "/graph/me/drive/items/item-a/content" {
            return Response::builder()
                .header(header::LAST_MODIFIED, "Wed, 01 May 2024 10:00:00 GMT")
                .body(Body::from("safe-a-content"))
                .unwrap();
        }

        (StatusCode::NOT_FOUND, "itemNotFound").into_response()
    }

    async fn spawn_stub() -> Arc<Stub> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stub = Arc::new(Stub {
            base: format!("http://{}", listener.local_addr().unwrap()),
            revoked: AtomicBool::new(false),
            token_unavailable: AtomicBool::new(false),
            rotates_refresh_token: AtomicBool::new(false),
            foreign_next_link: AtomicBool::new(false),
            profile_fails: AtomicBool::new(false),
            token_requests: Mutex::new(Vec::new()),
        });

        let app = Router::new().fallback(handle).with_state(stub.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        stub
    }

    fn provider_for(dir: &Path, stub: &Stub) -> OneDriveProvider {
        let config = AuthConfig {
            client_id: "test-client".to_string(),
            redirect_url: "https://safes.example.com/api/providers/onedrive/auth/callback"
                .to_string(),
            endpoints: Endpoints {
                authority: format!("{}/tenant", stub.base),
                graph_base: format!("{}/graph", stub.base),
            },
        };
        OneDriveProvider::new(dir, config).unwrap()
    }

    async fn connect(provider: &OneDriveProvider) {
        provider.auth_url().await.unwrap();
        provider.handle_callback("good-code").await.unwrap();
    }

    async fn write_credential(dir: &Path, credential: &Credential) {
        FileCredentialStore::new(dir).store(credential).await.unwrap();
    }

    fn stored_credential(dir: &Path) -> Credential {
        serde_json::from_slice(&std::fs::read(dir.join(TOKENS_FILE)).unwrap()).unwrap()
    }

    fn expired_credential() -> Credential {
        Credential {
            access_token: "access-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            expires_at: (chrono::Utc::now() - chrono::Duration::hours(1)).to_rfc3339(),
            account_name: "Ada Lovelace".to_string(),
            account_email: "ada@outlook.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_auth_url_persists_verifier() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        let provider = provider_for(temp.path(), &stub);

        let url = provider.auth_url().await.unwrap();
        assert!(url.starts_with(&format!("{}/tenant/oauth2/v2.0/authorize", stub.base)));
        assert!(url.contains("client_id=test-client"));

        let verifier = std::fs::read_to_string(temp.path().join(VERIFIER_FILE)).unwrap();
        assert!(!verifier.is_empty());

        // A second call replaces the transient secret
        provider.auth_url().await.unwrap();
        let replaced = std::fs::read_to_string(temp.path().join(VERIFIER_FILE)).unwrap();
        assert_ne!(verifier, replaced);
    }

    #[tokio::test]
    async fn test_callback_exchanges_code_with_verifier() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        let provider = provider_for(temp.path(), &stub);

        provider.auth_url().await.unwrap();
        let verifier = std::fs::read_to_string(temp.path().join(VERIFIER_FILE)).unwrap();

        provider.handle_callback("good-code").await.unwrap();

        let requests = stub.token_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["code_verifier"], verifier);
        assert_eq!(requests[0]["client_id"], "test-client");

        let credential = stored_credential(temp.path());
        assert_eq!(credential.access_token, "access-1");
        assert_eq!(credential.refresh_token, "refresh-1");
        assert_eq!(credential.account_name, "Ada Lovelace");
        assert_eq!(credential.account_email, "ada@outlook.com");
        assert!(!temp.path().join(VERIFIER_FILE).exists());

        let status = provider.connection_status(false).await.unwrap();
        assert!(status.connected);
        assert!(!status.needs_reauth);
        assert_eq!(status.account_email.as_deref(), Some("ada@outlook.com"));
    }

    #[tokio::test]
    async fn test_callback_without_verifier_fails() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        let provider = provider_for(temp.path(), &stub);

        let result = provider.handle_callback("good-code").await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(stub.token_requests().is_empty());
        assert!(!temp.path().join(TOKENS_FILE).exists());
    }

    #[tokio::test]
    async fn test_callback_with_stale_verifier_fails() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        let provider = provider_for(temp.path(), &stub);

        provider.auth_url().await.unwrap();
        let verifier_path = temp.path().join(VERIFIER_FILE);
        std::fs::File::options()
            .write(true)
            .open(&verifier_path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(16 * 60))
            .unwrap();

        let result = provider.handle_callback("good-code").await;
        assert!(matches!(result, Err(Error::Authentication(_))));
        assert!(!verifier_path.exists());
        assert!(stub.token_requests().is_empty());
        assert!(!temp.path().join(TOKENS_FILE).exists());
    }

    #[tokio::test]
    async fn test_rejected_code_keeps_disconnected() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        let provider = provider_for(temp.path(), &stub);

        provider.auth_url().await.unwrap();
        assert!(provider.handle_callback("bad-code").await.is_err());
        assert!(!temp.path().join(TOKENS_FILE).exists());
        assert!(!provider.connection_status(false).await.unwrap().connected);
    }

    #[tokio::test]
    async fn test_profile_failure_is_not_fatal() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        stub.profile_fails.store(true, Ordering::SeqCst);
        let provider = provider_for(temp.path(), &stub);

        connect(&provider).await;

        let status = provider.connection_status(false).await.unwrap();
        assert!(status.connected);
        assert_eq!(status.account_name, None);
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        let provider = provider_for(temp.path(), &stub);
        write_credential(temp.path(), &expired_credential()).await;

        let status = provider.connection_status(true).await.unwrap();
        assert!(status.connected);
        assert!(!status.needs_reauth);

        let credential = stored_credential(temp.path());
        assert_eq!(credential.access_token, "access-2");
        // Not rotated by the endpoint
        assert_eq!(credential.refresh_token, "refresh-1");
        assert_eq!(credential.account_email, "ada@outlook.com");
        assert!(!credential.is_expired().unwrap());

        let requests = stub.token_requests();
        assert_eq!(requests[0]["grant_type"], "refresh_token");
        assert_eq!(requests[0]["refresh_token"], "refresh-1");
    }

    #[tokio::test]
    async fn test_invalid_grant_requires_reauth_and_keeps_credentials() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        stub.revoked.store(true, Ordering::SeqCst);
        let provider = provider_for(temp.path(), &stub);
        write_credential(temp.path(), &expired_credential()).await;

        // The cheap path does not touch the network
        let status = provider.connection_status(false).await.unwrap();
        assert!(!status.needs_reauth);
        assert!(stub.token_requests().is_empty());

        let status = provider.connection_status(true).await.unwrap();
        assert!(status.connected);
        assert!(status.needs_reauth);
        assert!(temp.path().join(TOKENS_FILE).exists());

        let result = provider.list_remote_files().await;
        assert!(matches!(result, Err(Error::ReauthRequired(_))));
    }

    #[tokio::test]
    async fn test_transient_refresh_failure_does_not_require_reauth() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        stub.token_unavailable.store(true, Ordering::SeqCst);
        let provider = provider_for(temp.path(), &stub);
        write_credential(temp.path(), &expired_credential()).await;

        let status = provider.connection_status(true).await.unwrap();
        assert!(status.connected);
        assert!(!status.needs_reauth);
    }

    #[tokio::test]
    async fn test_corrupted_expiry_requires_reauth() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        let provider = provider_for(temp.path(), &stub);

        let mut credential = expired_credential();
        credential.expires_at = "garbage".to_string();
        write_credential(temp.path(), &credential).await;

        let status = provider.connection_status(false).await.unwrap();
        assert!(status.needs_reauth);
        assert!(!status.connected);
        assert!(temp.path().join(TOKENS_FILE).exists());
    }

    #[tokio::test]
    async fn test_list_remote_files_follows_pages() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        let provider = provider_for(temp.path(), &stub);
        connect(&provider).await;

        let files = provider.list_remote_files().await.unwrap();
        let summary: Vec<(&str, &str, &str)> = files
            .iter()
            .map(|f| (f.id.as_str(), f.name.as_str(), f.path.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("item-a", "a.psafe3", "/Documents"),
                ("item-b", "B.PSAFE3", "/"),
                ("item-c", "c.psafe3", "/Old Safes"),
            ]
        );
        assert!(files[0].last_modified.is_some());
    }

    #[tokio::test]
    async fn test_list_remote_files_rejects_foreign_page_link() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        let provider = provider_for(temp.path(), &stub);
        connect(&provider).await;
        stub.foreign_next_link.store(true, Ordering::SeqCst);

        let result = provider.list_remote_files().await;
        assert!(matches!(result, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_download_streams_content() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        let provider = provider_for(temp.path(), &stub);
        connect(&provider).await;

        let download = provider.download_file("item-a").await.unwrap();
        assert_eq!(
            download.last_modified.as_deref(),
            Some("Wed, 01 May 2024 10:00:00 GMT")
        );
        let chunks: Vec<bytes::Bytes> = download.content.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"safe-a-content");

        let missing = provider.download_file("item-zzz").await;
        match missing {
            Err(Error::Network(message)) => assert!(message.contains("404")),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_disconnected_operations_fail() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        let provider = provider_for(temp.path(), &stub);

        assert!(matches!(
            provider.list_remote_files().await,
            Err(Error::NotAuthenticated)
        ));
        assert!(matches!(
            provider.download_file("item-a").await,
            Err(Error::NotAuthenticated)
        ));
        assert_eq!(
            provider.connection_status(true).await.unwrap(),
            ConnectionStatus::disconnected()
        );
    }

    #[tokio::test]
    async fn test_concurrent_status_checks_refresh_once() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        stub.rotates_refresh_token.store(true, Ordering::SeqCst);
        let provider = provider_for(temp.path(), &stub);
        write_credential(temp.path(), &expired_credential()).await;

        let statuses =
            futures::future::join_all((0..8).map(|_| provider.connection_status(true))).await;

        for status in statuses {
            let status = status.unwrap();
            assert!(status.connected);
            assert!(!status.needs_reauth);
        }
        assert_eq!(stub.token_requests().len(), 1);

        let credential = stored_credential(temp.path());
        assert_eq!(credential.access_token, "access-2");
        assert_eq!(credential.refresh_token, "refresh-2");
    }

    #[tokio::test]
    async fn test_disconnect_removes_verifier_when_token_removal_fails() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        let provider = provider_for(temp.path(), &stub);
        provider.auth_url().await.unwrap();
        std::fs::create_dir(temp.path().join(TOKENS_FILE)).unwrap();

        assert!(provider.disconnect().await.is_err());
        assert!(!temp.path().join(VERIFIER_FILE).exists());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        let provider = provider_for(temp.path(), &stub);
        connect(&provider).await;
        provider.auth_url().await.unwrap();

        provider.disconnect().await.unwrap();
        assert!(!temp.path().join(TOKENS_FILE).exists());
        assert!(!temp.path().join(VERIFIER_FILE).exists());
        assert!(!provider.connection_status(false).await.unwrap().connected);

        provider.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_construction_removes_stale_verifier() {
        let temp = TempDir::new().unwrap();
        let stub = spawn_stub().await;
        let verifier_path = temp.path().join(VERIFIER_FILE);
        std::fs::write(&verifier_path, "left-over").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&verifier_path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(30 * 60))
            .unwrap();

        let _provider = provider_for(temp.path(), &stub);
        assert!(!verifier_path.exists());
    }
}
