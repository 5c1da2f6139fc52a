//! IDCS (SCIM REST) identity source.
//!
//! Authenticates with the OAuth2 client-credentials grant and drains the
//! `/admin/v1/Users` and `/admin/v1/Groups` list endpoints page by page.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::IdentitySource;
use crate::config::SourceConfig;
use crate::errors::SourceError;
use crate::models::{AttributeValue, GroupRecord, IdentityRecord, RecordSource};

const USERS_PATH: &str = "/admin/v1/Users";
const GROUPS_PATH: &str = "/admin/v1/Groups";

/// SCIM list response envelope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    total_results: u64,
    #[serde(rename = "Resources", default)]
    resources: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }
}

/// Asynchronous IDCS client.
pub struct IdcsSource {
    http: reqwest::Client,
    tenant_url: String,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
    scope: String,
    page_size: u32,
    token: RwLock<Option<CachedToken>>,
}

impl std::fmt::Debug for IdcsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdcsSource")
            .field("tenant_url", &self.tenant_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl IdcsSource {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let tenant_url = config.tenant_url.trim_end_matches('/').to_string();
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/scim+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("idsync/0.1"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let token_url = format!(
            "{}/{}",
            tenant_url,
            config.token_path.trim_start_matches('/')
        );
        info!(tenant_url = %tenant_url, "created IdcsSource");
        Ok(Self {
            http,
            tenant_url,
            token_url,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scope: config.scope.clone(),
            page_size: config.page_size,
            token: RwLock::new(None),
        })
    }

    /// Return a cached access token or fetch a new one.
    async fn access_token(&self) -> Result<String, SourceError> {
        {
            let cache = self.token.read().await;
            if let Some(cached) = cache.as_ref().filter(|c| !c.is_expired()) {
                return Ok(cached.access_token.clone());
            }
        }

        let secret = self.client_secret.as_deref().ok_or_else(|| {
            SourceError::AuthenticationFailed("client secret is not configured".into())
        })?;

        debug!(token_url = %self.token_url, "requesting access token");
        let resp = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(secret))
            .form(&[("grant_type", "client_credentials"), ("scope", self.scope.as_str())])
            .send()
            .await
            .map_err(map_transport)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::AuthenticationFailed(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SourceError::ParseError(format!("token response: {e}")))?;

        // Refresh a little before the provider expires the token.
        let expires_at = token
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs.saturating_sub(30)));
        let access_token = token.access_token.clone();
        *self.token.write().await = Some(CachedToken {
            access_token: token.access_token,
            expires_at,
        });
        Ok(access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.write().await = None;
    }

    /// GET one list page, retrying once with a fresh token on 401.
    async fn get_page(
        &self,
        path: &str,
        start_index: u64,
        attributes: Option<&str>,
    ) -> Result<ListResponse, SourceError> {
        let url = format!("{}{}", self.tenant_url, path);
        let mut query = vec![
            ("startIndex", start_index.to_string()),
            ("count", self.page_size.to_string()),
        ];
        if let Some(attrs) = attributes {
            query.push(("attributes", attrs.to_string()));
        }

        let mut retried = false;
        loop {
            let token = self.access_token().await?;
            let resp = self
                .http
                .get(&url)
                .bearer_auth(&token)
                .query(&query)
                .send()
                .await
                .map_err(map_transport)?;

            if resp.status() == StatusCode::UNAUTHORIZED && !retried {
                warn!(path, "access token rejected, refreshing");
                self.invalidate_token().await;
                retried = true;
                continue;
            }
            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                return Err(SourceError::ApiError { status, body });
            }
            return resp
                .json::<ListResponse>()
                .await
                .map_err(|e| SourceError::ParseError(format!("{path}: {e}")));
        }
    }

    /// Fetch every resource under `path`.
    async fn drain(
        &self,
        path: &str,
        attributes: Option<&str>,
    ) -> Result<Vec<serde_json::Value>, SourceError> {
        let mut resources = Vec::new();
        let mut start_index = 1;
        loop {
            let page = self.get_page(path, start_index, attributes).await?;
            let received = page.resources.len() as u64;
            debug!(path, start_index, received, total = page.total_results, "fetched page");
            resources.extend(page.resources);
            match next_start_index(start_index, received, page.total_results) {
                Some(next) => start_index = next,
                None => break,
            }
        }
        Ok(resources)
    }
}

#[async_trait]
impl IdentitySource for IdcsSource {
    async fn initialize(&self) -> Result<(), SourceError> {
        self.access_token().await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn list_users(&self) -> Result<Vec<IdentityRecord>, SourceError> {
        let resources = self.drain(USERS_PATH, None).await?;
        let users: Vec<IdentityRecord> = resources.into_iter().filter_map(user_from_scim).collect();
        info!(count = users.len(), "retrieved users from identity provider");
        Ok(users)
    }

    #[instrument(skip(self))]
    async fn list_groups(&self) -> Result<Vec<GroupRecord>, SourceError> {
        // Group members reference users by id; the join key is userName.
        let user_ids: HashMap<String, String> = self
            .drain(USERS_PATH, Some("id,userName"))
            .await?
            .into_iter()
            .filter_map(|u| {
                Some((
                    u.get("id")?.as_str()?.to_string(),
                    u.get("userName")?.as_str()?.to_string(),
                ))
            })
            .collect();

        let resources = self
            .drain(GROUPS_PATH, Some("id,displayName,description,members"))
            .await?;
        let groups: Vec<GroupRecord> = resources
            .into_iter()
            .filter_map(|g| group_from_scim(g, &user_ids))
            .collect();
        info!(count = groups.len(), "retrieved groups from identity provider");
        Ok(groups)
    }
}

/// Next 1-based start index, or `None` once the listing is exhausted.
fn next_start_index(start_index: u64, received: u64, total_results: u64) -> Option<u64> {
    if received == 0 {
        return None;
    }
    let next = start_index + received;
    (next <= total_results).then_some(next)
}

fn map_transport(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout(err.to_string())
    } else {
        SourceError::HttpError(err)
    }
}

fn str_at<'a>(value: &'a serde_json::Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

/// Convert a SCIM user resource. Resources without `userName` are skipped.
fn user_from_scim(resource: serde_json::Value) -> Option<IdentityRecord> {
    let Some(username) = str_at(&resource, &["userName"]).map(str::to_string) else {
        warn!("skipping user resource without userName");
        return None;
    };

    // First listed address, the same one the default `mail` mapping reads.
    let email = resource
        .get("emails")
        .and_then(|e| e.as_array())
        .and_then(|emails| emails.first())
        .and_then(|e| str_at(e, &["value"]))
        .map(str::to_string);

    let group_memberships: BTreeSet<String> = resource
        .get("groups")
        .and_then(|g| g.as_array())
        .map(|groups| {
            groups
                .iter()
                .filter_map(|g| str_at(g, &["display"]).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Some(IdentityRecord {
        id: str_at(&resource, &["id"]).unwrap_or(&username).to_string(),
        email,
        given_name: str_at(&resource, &["name", "givenName"]).map(str::to_string),
        family_name: str_at(&resource, &["name", "familyName"]).map(str::to_string),
        display_name: str_at(&resource, &["displayName"]).map(str::to_string),
        group_memberships,
        source: RecordSource::IdentityProvider,
        raw_attributes: AttributeValue::from(resource),
        username,
    })
}

/// Convert a SCIM group resource. `displayName` is the join key.
fn group_from_scim(
    resource: serde_json::Value,
    user_ids: &HashMap<String, String>,
) -> Option<GroupRecord> {
    let Some(name) = str_at(&resource, &["displayName"]).map(str::to_string) else {
        warn!("skipping group resource without displayName");
        return None;
    };

    let mut members = BTreeSet::new();
    if let Some(list) = resource.get("members").and_then(|m| m.as_array()) {
        for member in list {
            if member.get("type").and_then(|t| t.as_str()) == Some("Group") {
                debug!(group = %name, "skipping nested group member");
                continue;
            }
            let Some(id) = str_at(member, &["value"]) else {
                continue;
            };
            match user_ids.get(id) {
                Some(username) => {
                    members.insert(username.clone());
                }
                None => warn!(group = %name, member_id = id, "group member is not a known user"),
            }
        }
    }

    Some(GroupRecord {
        id: str_at(&resource, &["id"]).unwrap_or(&name).to_string(),
        display_name: Some(name.clone()),
        description: str_at(&resource, &["description"]).map(str::to_string),
        members,
        source: RecordSource::IdentityProvider,
        raw_attributes: AttributeValue::from(resource),
        name,
    })
}
