//! GitHub REST API client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, LINK, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::auth::{mask_token, Credential, TokenValidator};
use crate::config::{seconds, ApiConfig};
use crate::error::{AuthError, SourceError};
use crate::source::{ListOptions, PageInfo, RateLimitInfo, StarSource, StarredPage};
use crate::state::Repository;

/// Media type that adds `starred_at` to each entry
const STAR_MEDIA_TYPE: &str = "application/vnd.github.star+json";
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("star-watcher/", env!("CARGO_PKG_VERSION"));
/// Longest `Retry-After` we honour
const MAX_RETRY_AFTER_SECS: u64 = 3600;

#[derive(Debug, Deserialize)]
struct StarredEntry {
    starred_at: DateTime<Utc>,
    repo: RepoPayload,
}

#[derive(Debug, Deserialize)]
struct RepoPayload {
    full_name: String,
    description: Option<String>,
    stargazers_count: u64,
    updated_at: DateTime<Utc>,
    html_url: String,
    language: Option<String>,
    #[serde(default)]
    private: bool,
}

impl From<StarredEntry> for Repository {
    fn from(entry: StarredEntry) -> Self {
        let repo = entry.repo;
        Repository {
            full_name: repo.full_name,
            description: repo.description.unwrap_or_default(),
            star_count: repo.stargazers_count,
            updated_at: repo.updated_at,
            url: repo.html_url,
            starred_at: entry.starred_at,
            language: repo.language.unwrap_or_default(),
            private: repo.private,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// GitHub API session. Cloning shares the connection pool.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(config: &ApiConfig) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Same connection pool, different token
    fn with_token(&self, token: &str) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token.to_string()),
        }
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Response, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .get(&url)
            .query(query)
            .header(ACCEPT, STAR_MEDIA_TYPE)
            .header("X-GitHub-Api-Version", API_VERSION);
        if let Some(ref token) = self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        debug!("GET {}", url);
        let response = request.send().await.map_err(transport_error)?;
        check_status(response).await
    }
}

#[async_trait]
impl StarSource for GitHubClient {
    async fn list_starred(
        &self,
        username: &str,
        options: &ListOptions,
    ) -> Result<StarredPage, SourceError> {
        let page = match options.cursor.as_deref() {
            None => 1,
            Some(cursor) => cursor
                .parse::<u32>()
                .map_err(|_| SourceError::Decode(format!("invalid page cursor '{}'", cursor)))?,
        };

        let query = [
            ("per_page", options.per_page.to_string()),
            ("sort", options.sort.to_string()),
            ("direction", options.direction.to_string()),
            ("page", page.to_string()),
        ];
        let response = self
            .get(&format!("/users/{}/starred", username), &query)
            .await?;

        let rate_limit = parse_rate_limit(response.headers());
        let next_cursor = response
            .headers()
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(next_page);

        let entries: Vec<StarredEntry> = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        Ok(StarredPage {
            repositories: entries.into_iter().map(Repository::from).collect(),
            page_info: PageInfo {
                has_next: next_cursor.is_some(),
                next_cursor,
            },
            rate_limit,
        })
    }

    async fn validate_user(&self, username: &str) -> Result<(), SourceError> {
        self.get(&format!("/users/{}", username), &[]).await?;
        Ok(())
    }

    fn with_credential(&self, credential: &Credential) -> Arc<dyn StarSource> {
        Arc::new(self.with_token(&credential.token))
    }
}

#[async_trait]
impl TokenValidator for GitHubClient {
    /// `GET /user` with the token; 401 means GitHub does not accept it.
    async fn validate_token(&self, token: &str) -> Result<String, AuthError> {
        let response = self
            .with_token(token)
            .get("/user", &[])
            .await
            .map_err(|e| match e {
                SourceError::Unauthorized(reason) => AuthError::InvalidToken {
                    token: mask_token(token),
                    reason,
                },
                other => AuthError::Verification(other.to_string()),
            })?;

        let user: UserPayload = response
            .json()
            .await
            .map_err(|e| AuthError::Verification(e.to_string()))?;
        debug!("Token belongs to {}", user.login);
        Ok(user.login)
    }
}

fn transport_error(err: reqwest::Error) -> SourceError {
    if err.is_decode() {
        SourceError::Decode(err.to_string())
    } else {
        SourceError::Transient(err.to_string())
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn parse_rate_limit(headers: &HeaderMap) -> Option<RateLimitInfo> {
    let limit = header_u64(headers, "x-ratelimit-limit")?;
    let remaining = header_u64(headers, "x-ratelimit-remaining")?;
    let reset_at = header_u64(headers, "x-ratelimit-reset")
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
    let used = header_u64(headers, "x-ratelimit-used")
        .unwrap_or_else(|| limit.saturating_sub(remaining));

    Some(RateLimitInfo {
        limit,
        remaining,
        reset_at,
        used,
    })
}

/// Page number of the `rel="next"` entry in a `Link` header.
fn next_page(link: &str) -> Option<String> {
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.split(';').any(|p| p.trim() == r#"rel="next""#) {
            return None;
        }
        let target = target.trim().trim_start_matches('<').trim_end_matches('>');
        let url = reqwest::Url::parse(target).ok()?;
        url.query_pairs()
            .find(|(key, _)| key == "page")
            .map(|(_, value)| value.into_owned())
    })
}

async fn check_status(response: Response) -> Result<Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let rate_limit = parse_rate_limit(response.headers());
    let retry_after = header_u64(response.headers(), RETRY_AFTER.as_str())
        .map(|secs| Utc::now() + seconds(secs.min(MAX_RETRY_AFTER_SECS)));

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|e| e.message)
        .unwrap_or(body);

    let exhausted = rate_limit.as_ref().map_or(false, |rl| rl.remaining == 0);
    let rate_limited = || SourceError::RateLimited {
        reset_at: retry_after.or_else(|| rate_limit.as_ref().and_then(|rl| rl.reset_at)),
        limit: rate_limit.as_ref().map(|rl| rl.limit),
    };

    Err(match status {
        StatusCode::NOT_FOUND => SourceError::NotFound(message),
        StatusCode::UNAUTHORIZED => SourceError::Unauthorized(message),
        StatusCode::TOO_MANY_REQUESTS => rate_limited(),
        StatusCode::FORBIDDEN if exhausted || retry_after.is_some() => rate_limited(),
        s if s.is_server_error() => SourceError::Server {
            status: s.as_u16(),
            message,
        },
        s => SourceError::Api {
            status: s.as_u16(),
            message,
        },
    })
}
