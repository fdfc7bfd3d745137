// src/services/graph_api.rs

//! Outbound social-graph API (XRPC over HTTP).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{ActorProfile, CrawlerConfig, Direction, NeighborPage};
use crate::utils::http::create_async_client;

/// Most actors accepted by one profile lookup.
pub const MAX_PROFILES_PER_CALL: usize = 25;

/// Paginated neighbor listing and profile lookup.
#[async_trait]
pub trait GraphApi: Send + Sync {
    /// One page of `actor`'s followers or follows.
    async fn list_neighbors(
        &self,
        direction: Direction,
        actor: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<NeighborPage>;

    /// Detailed profiles (with counts) for up to
    /// [`MAX_PROFILES_PER_CALL`] actors.
    async fn get_profiles(&self, actors: &[String]) -> Result<Vec<ActorProfile>>;
}

#[derive(Deserialize)]
struct FollowersResponse {
    #[serde(default)]
    followers: Vec<ActorProfile>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct FollowsResponse {
    #[serde(default)]
    follows: Vec<ActorProfile>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct ProfilesResponse {
    #[serde(default)]
    profiles: Vec<ActorProfile>,
}

#[derive(Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct XrpcClient {
    client: reqwest::Client,
    base: Url,
    access_token: Option<String>,
}

impl XrpcClient {
    pub fn new(config: &CrawlerConfig) -> Result<Self> {
        Ok(Self {
            client: create_async_client(config)?,
            base: Url::parse(&config.api_base_url)?,
            access_token: config.access_token.clone(),
        })
    }

    /// URL of an XRPC method.
    pub fn method_url(&self, nsid: &str) -> Result<Url> {
        Ok(self.base.join(&format!("/xrpc/{nsid}"))?)
    }

    async fn get_json<T: DeserializeOwned>(&self, nsid: &str, url: Url) -> Result<T> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let retry_after = retry_after(response.headers(), chrono::Utc::now().timestamp());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(nsid, status, retry_after, &body))
    }
}

#[async_trait]
impl GraphApi for XrpcClient {
    async fn list_neighbors(
        &self,
        direction: Direction,
        actor: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<NeighborPage> {
        let nsid = match direction {
            Direction::Followers => "app.bsky.graph.getFollowers",
            Direction::Follows => "app.bsky.graph.getFollows",
        };
        let mut url = self.method_url(nsid)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("actor", actor);
            query.append_pair("limit", &limit.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }

        let page = match direction {
            Direction::Followers => {
                let r: FollowersResponse = self.get_json(nsid, url).await?;
                NeighborPage {
                    items: r.followers,
                    cursor: r.cursor,
                }
            }
            Direction::Follows => {
                let r: FollowsResponse = self.get_json(nsid, url).await?;
                NeighborPage {
                    items: r.follows,
                    cursor: r.cursor,
                }
            }
        };
        Ok(page)
    }

    async fn get_profiles(&self, actors: &[String]) -> Result<Vec<ActorProfile>> {
        if actors.is_empty() {
            return Ok(Vec::new());
        }
        if actors.len() > MAX_PROFILES_PER_CALL {
            return Err(AppError::validation(format!(
                "profile lookup of {} actors exceeds {MAX_PROFILES_PER_CALL}",
                actors.len()
            )));
        }
        let nsid = "app.bsky.actor.getProfiles";
        let mut url = self.method_url(nsid)?;
        {
            let mut query = url.query_pairs_mut();
            for actor in actors {
                query.append_pair("actors", actor);
            }
        }
        let r: ProfilesResponse = self.get_json(nsid, url).await?;
        Ok(r.profiles)
    }
}

/// Delay hinted by a rate-limit response.
///
/// `retry-after` is taken as seconds; `ratelimit-reset` as a unix timestamp.
fn retry_after(headers: &HeaderMap, now: i64) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };
    if let Some(secs) = header("retry-after") {
        return Some(Duration::from_secs(secs.max(0) as u64));
    }
    header("ratelimit-reset").map(|reset| Duration::from_secs((reset - now).max(0) as u64))
}

fn classify_status(
    nsid: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> AppError {
    let detail = serde_json::from_str::<XrpcErrorBody>(body)
        .ok()
        .map(|b| {
            format!(
                "{}: {}",
                b.error.unwrap_or_default(),
                b.message.unwrap_or_default()
            )
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        StatusCode::TOO_MANY_REQUESTS => AppError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AppError::Auth(format!("{nsid} returned {status}: {detail}"))
        }
        s if s.is_server_error() => AppError::connection(format!("{nsid} returned {s}: {detail}")),
        s => AppError::crawl(nsid, format!("{s}: {detail}")),
    }
}
