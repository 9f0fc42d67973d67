use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::backoff::{Backoff, RetryPolicy};
use crate::cache::ResponseCache;
use crate::models::{
    AppDetailsEntry, Envelope, GameDetails, OwnedGame, OwnedGamesResponse, PlayerProfile,
    PlayerSummariesResponse, RecentGame, RecentGamesResponse, ReviewSummary, ReviewsResponse,
};
use crate::rate_limit::RateLimiter;

const DEFAULT_API_BASE_URL: &str = "https://api.steampowered.com";
const DEFAULT_STORE_BASE_URL: &str = "https://store.steampowered.com";
const MAX_ERROR_MESSAGE_CHARS: usize = 256;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{endpoint} returned {status}: {message}")]
    Api {
        status: StatusCode,
        message: String,
        endpoint: String,
    },
    #[error("{endpoint} has no data for {id}")]
    NotFound { endpoint: String, id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub store_base_url: String,
    pub requests_per_second: f64,
    pub burst: u32,
    pub cache_ttl: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            store_base_url: DEFAULT_STORE_BASE_URL.to_string(),
            requests_per_second: 1.0,
            burst: 5,
            cache_ttl: Duration::from_secs(300),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(8),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Client for the remote game catalog.
///
/// Clones share one rate limiter and one response cache, so every sync job in
/// the process draws from the same request budget.
#[derive(Clone)]
pub struct CatalogClient {
    http: Client,
    api_base: Url,
    store_base: Url,
    api_key: String,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache>,
    retry: RetryPolicy,
}

struct FailedAttempt {
    error: CatalogError,
    retry_after: Option<Duration>,
}

impl From<CatalogError> for FailedAttempt {
    fn from(error: CatalogError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

impl CatalogClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, CatalogError> {
        Self::with_config(api_key, ClientConfig::default())
    }

    /// Points both the web API and the store API at `base_url`.
    pub fn with_base_url(base_url: &str, api_key: impl Into<String>) -> Result<Self, CatalogError> {
        Self::with_config(
            api_key,
            ClientConfig {
                api_base_url: base_url.to_string(),
                store_base_url: base_url.to_string(),
                ..ClientConfig::default()
            },
        )
    }

    pub fn with_config(
        api_key: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Self, CatalogError> {
        Ok(Self {
            http: Client::builder().timeout(config.request_timeout).build()?,
            api_base: Url::parse(&config.api_base_url)?,
            store_base: Url::parse(&config.store_base_url)?,
            api_key: api_key.into(),
            limiter: Arc::new(RateLimiter::new(config.requests_per_second, config.burst)),
            cache: Arc::new(ResponseCache::new(config.cache_ttl)),
            retry: RetryPolicy::new(
                config.max_retries,
                Backoff::new(config.retry_base_delay, config.retry_max_delay, true),
            ),
        })
    }

    pub async fn get_owned_games(&self, owner_id: &str) -> Result<Vec<OwnedGame>, CatalogError> {
        let payload: Envelope<OwnedGamesResponse> = self
            .fetch_api(
                "/IPlayerService/GetOwnedGames/v1/",
                &[
                    ("steamid", owner_id.to_string()),
                    ("include_appinfo", "1".to_string()),
                    ("include_played_free_games", "1".to_string()),
                ],
            )
            .await?;
        Ok(payload.response.games)
    }

    pub async fn get_recently_played(
        &self,
        owner_id: &str,
    ) -> Result<Vec<RecentGame>, CatalogError> {
        let payload: Envelope<RecentGamesResponse> = self
            .fetch_api(
                "/IPlayerService/GetRecentlyPlayedGames/v1/",
                &[("steamid", owner_id.to_string())],
            )
            .await?;
        Ok(payload.response.games)
    }

    pub async fn get_player_profile(&self, owner_id: &str) -> Result<PlayerProfile, CatalogError> {
        let endpoint = "/ISteamUser/GetPlayerSummaries/v2/";
        let payload: Envelope<PlayerSummariesResponse> = self
            .fetch_api(endpoint, &[("steamids", owner_id.to_string())])
            .await?;
        payload
            .response
            .players
            .into_iter()
            .find(|player| player.steamid == owner_id)
            .ok_or_else(|| CatalogError::NotFound {
                endpoint: endpoint.to_string(),
                id: owner_id.to_string(),
            })
    }

    pub async fn get_game_details(&self, app_id: u32) -> Result<GameDetails, CatalogError> {
        let endpoint = "/api/appdetails";
        let mut payload: HashMap<String, AppDetailsEntry> = self
            .fetch(
                &self.store_base,
                endpoint,
                &[("appids", app_id.to_string())],
                false,
            )
            .await?;
        payload
            .remove(&app_id.to_string())
            .filter(|entry| entry.success)
            .and_then(|entry| entry.data)
            .ok_or_else(|| CatalogError::NotFound {
                endpoint: endpoint.to_string(),
                id: app_id.to_string(),
            })
    }

    pub async fn get_game_reviews(&self, app_id: u32) -> Result<ReviewSummary, CatalogError> {
        let endpoint = format!("/appreviews/{app_id}");
        let payload: ReviewsResponse = self
            .fetch(
                &self.store_base,
                &endpoint,
                &[
                    ("json", "1".to_string()),
                    ("language", "all".to_string()),
                    ("purchase_type", "all".to_string()),
                    ("num_per_page", "0".to_string()),
                ],
                false,
            )
            .await?;
        match payload.query_summary {
            Some(summary) if payload.success == 1 => Ok(summary),
            _ => Err(CatalogError::NotFound {
                endpoint,
                id: app_id.to_string(),
            }),
        }
    }

    /// Checks the configured key against the catalog. An auth rejection is
    /// reported as `Ok(false)`; any other failure is an error.
    pub async fn validate_api_key(&self) -> Result<bool, CatalogError> {
        let endpoint = "/ISteamWebAPIUtil/GetSupportedAPIList/v1/";
        let url = self.build_url(&self.api_base, endpoint, &[], true)?;
        match self.send_with_retry(endpoint, url).await {
            Ok(_) => Ok(true),
            Err(err) if err.classification() == Some(ApiErrorClass::Auth) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Drops expired cache entries; returns how many were removed.
    pub fn purge_cache(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn cached_responses(&self) -> usize {
        self.cache.len()
    }

    async fn fetch_api<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, CatalogError> {
        self.fetch(&self.api_base, endpoint, params, true).await
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        base: &Url,
        endpoint: &str,
        params: &[(&str, String)],
        authenticated: bool,
    ) -> Result<T, CatalogError> {
        let key = cache_key(base, endpoint, params);
        if let Some(body) = self.cache.get(&key) {
            debug!(endpoint, "catalog cache hit");
            return decode(endpoint, body);
        }
        let url = self.build_url(base, endpoint, params, authenticated)?;
        let body = self.send_with_retry(endpoint, url).await?;
        self.cache.insert(key, body.clone());
        decode(endpoint, body)
    }

    fn build_url(
        &self,
        base: &Url,
        endpoint: &str,
        params: &[(&str, String)],
        authenticated: bool,
    ) -> Result<Url, CatalogError> {
        let mut url = base.join(endpoint)?;
        {
            let mut query = url.query_pairs_mut();
            if authenticated {
                query.append_pair("key", &self.api_key);
            }
            for (name, value) in params {
                query.append_pair(name, value);
            }
            query.append_pair("format", "json");
        }
        Ok(url)
    }

    async fn send_with_retry(
        &self,
        endpoint: &str,
        url: Url,
    ) -> Result<serde_json::Value, CatalogError> {
        let mut attempt = 0u32;
        loop {
            self.limiter.acquire().await;
            match self.send_once(endpoint, url.clone()).await {
                Ok(body) => return Ok(body),
                Err(failed) if failed.error.is_retryable() && self.retry.allows(attempt) => {
                    let delay = self.retry.delay_for(attempt, failed.retry_after);
                    debug!(
                        endpoint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failed.error,
                        "retrying catalog request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(failed) => return Err(failed.error),
            }
        }
    }

    async fn send_once(
        &self,
        endpoint: &str,
        url: Url,
    ) -> Result<serde_json::Value, FailedAttempt> {
        let response = self.http.get(url).send().await.map_err(CatalogError::from)?;
        let status = response.status();
        if status.is_success() {
            let text = response.text().await.map_err(CatalogError::from)?;
            return serde_json::from_str(&text).map_err(|source| {
                FailedAttempt::from(CatalogError::Decode {
                    endpoint: endpoint.to_string(),
                    source,
                })
            });
        }
        let retry_after = response.headers().get(RETRY_AFTER).and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        Err(FailedAttempt {
            error: CatalogError::Api {
                status,
                message: body.trim().chars().take(MAX_ERROR_MESSAGE_CHARS).collect(),
                endpoint: endpoint.to_string(),
            },
            retry_after,
        })
    }
}

impl CatalogError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            CatalogError::Api { status, .. } => Some(classify_api_status(*status)),
            CatalogError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            CatalogError::Api { status, .. } => Some(*status),
            CatalogError::Request(err) => err.status(),
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn cache_key(base: &Url, endpoint: &str, params: &[(&str, String)]) -> String {
    let mut pairs: Vec<String> = params
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    pairs.sort();
    format!(
        "{}{}?{}",
        base.as_str().trim_end_matches('/'),
        endpoint,
        pairs.join("&")
    )
}

fn decode<T: DeserializeOwned>(endpoint: &str, body: serde_json::Value) -> Result<T, CatalogError> {
    serde_json::from_value(body).map_err(|source| CatalogError::Decode {
        endpoint: endpoint.to_string(),
        source,
    })
}

fn parse_retry_after(value: &HeaderValue) -> Option<Duration> {
    let value = value.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or_default())
}
