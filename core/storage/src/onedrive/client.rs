//! Microsoft Graph API client.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use percent_encoding::percent_decode_str;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;

use safesync_common::{is_safe_file, Error, Result, SAFE_EXTENSION};

use super::auth::TokenManager;
use crate::provider::{Download, RemoteFile};

/// A drive item as returned by the Graph search endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent_reference: Option<ParentReference>,
    #[serde(default)]
    pub last_modified_date_time: Option<DateTime<Utc>>,
}

/// Location of a drive item's parent folder.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParentReference {
    /// e.g. `/drive/root:/Documents/My%20Safes`
    #[serde(default)]
    pub path: Option<String>,
}

impl DriveItem {
    /// Parent folder path with the drive prefix removed and percent-decoding
    /// applied. Items at the drive root map to `/`.
    pub fn parent_path(&self) -> String {
        let raw = self
            .parent_reference
            .as_ref()
            .and_then(|p| p.path.as_deref())
            .unwrap_or_default();
        let relative = raw.split_once(':').map(|(_, rest)| rest).unwrap_or(raw);
        let decoded = percent_decode_str(relative)
            .decode_utf8()
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| relative.to_string());

        if decoded.is_empty() {
            "/".to_string()
        } else {
            decoded
        }
    }

    /// Convert into the backend-neutral file description.
    pub fn into_remote_file(self) -> RemoteFile {
        RemoteFile {
            path: self.parent_path(),
            id: self.id,
            name: self.name,
            last_modified: self.last_modified_date_time,
        }
    }
}

/// One page of a collection response.
#[derive(Debug, Deserialize)]
struct ItemPage {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

/// The signed-in user's profile.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub mail: Option<String>,
    #[serde(default)]
    pub user_principal_name: Option<String>,
}

impl UserProfile {
    /// Mail address, falling back to the user principal name.
    pub fn email(&self) -> String {
        self.mail
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| self.user_principal_name.clone())
            .unwrap_or_default()
    }
}

/// Microsoft Graph API client.
pub struct GraphClient {
    http: Client,
    base_url: String,
    token_manager: Arc<TokenManager>,
}

impl GraphClient {
    /// Create a new Graph client.
    pub fn new(base_url: impl Into<String>, token_manager: Arc<TokenManager>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("SafeSync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token_manager,
        })
    }

    /// Get authorization header.
    async fn auth_header(&self) -> Result<String> {
        let token = self.token_manager.access_token().await?;
        Ok(format!("Bearer {}", token))
    }

    /// Search the whole drive for safe files.
    ///
    /// Follows `@odata.nextLink` until the last page. Search is fuzzy, so
    /// results not carrying the safe extension are dropped.
    pub async fn search_safes(&self) -> Result<Vec<RemoteFile>> {
        let mut url = format!(
            "{}/me/drive/root/search(q='{}')",
            self.base_url, SAFE_EXTENSION
        );
        let mut files = Vec::new();

        loop {
            let auth = self.auth_header().await?;
            let response = self
                .http
                .get(&url)
                .header(header::AUTHORIZATION, auth)
                .send()
                .await
                .map_err(|e| Error::Network(format!("Search request failed: {}", e)))?;

            let page: ItemPage = self.handle_response(response).await?;
            files.extend(
                page.value
                    .into_iter()
                    .filter(|item| is_safe_file(&item.name))
                    .map(DriveItem::into_remote_file),
            );

            match page.next_link {
                Some(next) if self.is_graph_url(&next) => url = next,
                Some(next) => {
                    return Err(Error::Network(format!(
                        "Refusing to follow page link outside the Graph API: {}",
                        next
                    )));
                }
                None => break,
            }
        }

        Ok(files)
    }

    /// Whether `url` lies under the configured API base, so it may carry the
    /// bearer token.
    fn is_graph_url(&self, url: &str) -> bool {
        url.strip_prefix(self.base_url.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Fetch the profile of the user owning `access_token`.
    pub async fn profile(&self, access_token: &str) -> Result<UserProfile> {
        let url = format!("{}/me", self.base_url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Profile request failed: {}", e)))?;

        self.handle_response(response).await
    }

    /// Download file as a stream.
    pub async fn download_stream(&self, item_id: &str) -> Result<Download> {
        let url = format!("{}/me/drive/items/{}/content", self.base_url, item_id);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to start download: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Network(format!(
                "Download failed: {} - {}",
                status, body
            )));
        }

        let last_modified = response
            .headers()
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let stream = response
            .bytes_stream()
            .map(|result| result.map_err(|e| Error::Network(format!("Stream read error: {}", e))));

        Ok(Download {
            content: Box::pin(stream),
            last_modified,
        })
    }

    /// Handle API response with error checking.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
        } else if status == StatusCode::NOT_FOUND {
            Err(Error::NotFound("Resource not found".to_string()))
        } else if status == StatusCode::UNAUTHORIZED {
            Err(Error::Authentication("Invalid or expired token".to_string()))
        } else if status == StatusCode::FORBIDDEN {
            Err(Error::PermissionDenied("Access denied".to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Network(format!("API error: {} - {}", status, body)))
        }
    }
}
