// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

//! A typed REST + batched-GraphQL client for a Git-compatible forge's
//! metadata API (GitHub-shaped by default).
//!
//! Every owner/name pair is validated against the same character class as
//! the URL canonicalizer before it is substituted into a REST path or a
//! hand-assembled GraphQL document, defending against header/query
//! injection from an attacker-controlled repository name.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, stream};
use reqwest::{StatusCode, header};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;
const DEFAULT_RATE_LIMIT_SUSPEND: Duration = Duration::from_secs(60);
const MAX_BATCH_CHUNK: usize = 100;
const FALLBACK_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
    #[error("owner/name {0:?}/{1:?} contains a character outside the allowed set")]
    InvalidIdentifier(String, String),
    #[error("authentication failed")]
    Auth,
    #[error("rate limited, resets at epoch {reset_epoch}")]
    RateLimited { reset_epoch: i64 },
    #[error("transport error after {attempts} attempt(s): {message}")]
    Transport { attempts: u32, message: String },
    #[error("forge returned an unexpected response: {0}")]
    Unexpected(String),
}

/// The shape every repo-metadata lookup returns, whether it came from REST
/// or GraphQL. A 404 is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    pub description: Option<String>,
    pub private: bool,
    pub archived: bool,
    pub not_found: bool,
}

impl RepoInfo {
    fn not_found() -> Self {
        Self {
            description: None,
            private: false,
            archived: false,
            not_found: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub limit: u32,
    pub remaining: u32,
    pub reset_epoch: i64,
}

struct Suspension {
    until: Mutex<Option<Instant>>,
}

/// A client bound to one forge's API base URL and an optional bearer token.
pub struct Client {
    http: reqwest::Client,
    api_base: Url,
    graphql_url: Option<Url>,
    token: Option<String>,
    suspension: Arc<Suspension>,
}

impl Client {
    /// `api_base` must be `https`, name a host (not a bare IP unless
    /// `allow_private_host` is set, which exists purely for integration
    /// tests that point at a loopback mock server).
    pub fn new(api_base: Url, token: Option<String>) -> Result<Self, Error> {
        Self::with_options(api_base, token, None, false)
    }

    pub fn with_options(
        api_base: Url,
        token: Option<String>,
        graphql_url: Option<Url>,
        allow_private_host: bool,
    ) -> Result<Self, Error> {
        validate_base_url(&api_base, allow_private_host)?;

        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::Unexpected(e.to_string()))?;

        Ok(Self {
            http,
            api_base,
            graphql_url,
            token,
            suspension: Arc::new(Suspension { until: Mutex::new(None) }),
        })
    }

    fn auth_headers(&self) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, "application/vnd.github+json".parse().unwrap());
        headers.insert("X-GitHub-Api-Version", "2022-11-28".parse().unwrap());
        if let Some(token) = &self.token {
            if let Ok(value) = header::HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(header::AUTHORIZATION, value);
            }
        }
        headers
    }

    async fn wait_out_suspension(&self) {
        let deadline = *self.suspension.until.lock().await;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if deadline > now {
                tokio::time::sleep(deadline - now).await;
            }
        }
    }

    async fn record_rate_limit(&self, reset_epoch: Option<i64>) {
        let wait = match reset_epoch {
            Some(epoch) => {
                let now = chrono_like_now_epoch();
                let delta = (epoch - now).max(0) as u64;
                Duration::from_secs(delta)
            }
            None => DEFAULT_RATE_LIMIT_SUSPEND,
        };
        let mut until = self.suspension.until.lock().await;
        *until = Some(Instant::now() + wait);
    }

    /// Fetch one repository's metadata over REST.
    pub async fn get_repo(&self, owner: &str, name: &str) -> Result<RepoInfo, Error> {
        validate_identifier(owner, name)?;
        self.wait_out_suspension().await;

        let url = self
            .api_base
            .join(&format!("repos/{owner}/{name}"))
            .map_err(|e| Error::Unexpected(e.to_string()))?;

        let response = self.retrying_get(url).await?;

        match response.status() {
            StatusCode::OK => {
                let body: RestRepo = response.json().await.map_err(|e| Error::Unexpected(e.to_string()))?;
                Ok(RepoInfo {
                    description: body.description,
                    private: body.private,
                    archived: body.archived,
                    not_found: false,
                })
            }
            StatusCode::NOT_FOUND => Ok(RepoInfo::not_found()),
            StatusCode::UNAUTHORIZED => Err(Error::Auth),
            StatusCode::FORBIDDEN => self.classify_forbidden(response).await,
            StatusCode::TOO_MANY_REQUESTS => {
                let reset_epoch = reset_epoch_from_headers(response.headers());
                self.record_rate_limit(reset_epoch).await;
                Err(Error::RateLimited {
                    reset_epoch: reset_epoch.unwrap_or(0),
                })
            }
            other => Err(Error::Unexpected(format!("unexpected status {other}"))),
        }
    }

    async fn classify_forbidden(&self, response: reqwest::Response) -> Result<RepoInfo, Error> {
        let remaining = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok());

        if remaining == Some(0) {
            let reset_epoch = reset_epoch_from_headers(response.headers());
            self.record_rate_limit(reset_epoch).await;
            Err(Error::RateLimited {
                reset_epoch: reset_epoch.unwrap_or(0),
            })
        } else {
            Err(Error::Auth)
        }
    }

    async fn retrying_get(&self, url: Url) -> Result<reqwest::Response, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.http.get(url.clone()).headers(self.auth_headers()).send().await;

            match result {
                Ok(response) => return Ok(response),
                Err(err) if attempt < MAX_RETRIES && is_retriable(&err) => {
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt - 1));
                    tracing::warn!(attempt, %err, "forge transport error, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    return Err(Error::Transport {
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    /// Fetch many repositories' metadata in input order. Prefers a single
    /// batched GraphQL request (numeric aliases keep the query one round
    /// trip regardless of batch size); falls back to bounded-concurrency
    /// parallel REST calls when no token is configured or the GraphQL
    /// transport itself fails.
    pub async fn batch_get_repos(&self, pairs: &[(String, String)]) -> Result<Vec<RepoInfo>, Error> {
        for (owner, name) in pairs {
            validate_identifier(owner, name)?;
        }

        let mut out = Vec::with_capacity(pairs.len());
        for chunk in pairs.chunks(MAX_BATCH_CHUNK) {
            let results = self.batch_chunk(chunk).await?;
            out.extend(results);
        }
        Ok(out)
    }

    async fn batch_chunk(&self, pairs: &[(String, String)]) -> Result<Vec<RepoInfo>, Error> {
        if self.token.is_some() {
            match self.graphql_batch(pairs).await {
                Ok(results) => return Ok(results),
                Err(err) => {
                    tracing::warn!(%err, "graphql batch failed, falling back to REST");
                }
            }
        }
        self.rest_fallback(pairs).await
    }

    async fn rest_fallback(&self, pairs: &[(String, String)]) -> Result<Vec<RepoInfo>, Error> {
        let results: Vec<Result<RepoInfo, Error>> = stream::iter(pairs.iter())
            .map(|(owner, name)| self.get_repo(owner, name))
            .buffered(FALLBACK_CONCURRENCY)
            .collect()
            .await;

        results.into_iter().collect()
    }

    async fn graphql_batch(&self, pairs: &[(String, String)]) -> Result<Vec<RepoInfo>, Error> {
        self.wait_out_suspension().await;

        let graphql_url = self
            .graphql_url
            .clone()
            .unwrap_or_else(|| self.api_base.join("graphql").expect("static join"));

        let mut fields = String::new();
        for (index, (owner, name)) in pairs.iter().enumerate() {
            fields.push_str(&format!(
                "r{index}: repository(owner: {owner:?}, name: {name:?}) {{ description isPrivate isArchived }}\n"
            ));
        }
        let query = format!("query BatchRepos {{\n{fields}}}");

        let response = self
            .http
            .post(graphql_url)
            .headers(self.auth_headers())
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await
            .map_err(|e| Error::Transport {
                attempts: 1,
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::Transport {
                attempts: 1,
                message: format!("graphql endpoint returned {}", response.status()),
            });
        }

        let parsed: graphql_client::Response<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| Error::Unexpected(e.to_string()))?;

        let data = parsed
            .data
            .ok_or_else(|| Error::Unexpected("graphql response had no data".into()))?;

        let mut out = Vec::with_capacity(pairs.len());
        for index in 0..pairs.len() {
            let key = format!("r{index}");
            let entry = data.get(&key);
            out.push(match entry {
                None | Some(serde_json::Value::Null) => RepoInfo::not_found(),
                Some(value) => {
                    let repo: GraphQlRepo =
                        serde_json::from_value(value.clone()).map_err(|e| Error::Unexpected(e.to_string()))?;
                    RepoInfo {
                        description: repo.description,
                        private: repo.is_private,
                        archived: repo.is_archived,
                        not_found: false,
                    }
                }
            });
        }
        Ok(out)
    }

    pub async fn rate_limit(&self) -> Result<RateLimit, Error> {
        self.wait_out_suspension().await;

        let url = self
            .api_base
            .join("rate_limit")
            .map_err(|e| Error::Unexpected(e.to_string()))?;
        let response = self.retrying_get(url).await?;

        if !response.status().is_success() {
            return Err(Error::Unexpected(format!("unexpected status {}", response.status())));
        }

        let body: RestRateLimit = response.json().await.map_err(|e| Error::Unexpected(e.to_string()))?;
        Ok(RateLimit {
            limit: body.resources.core.limit,
            remaining: body.resources.core.remaining,
            reset_epoch: body.resources.core.reset,
        })
    }
}

fn validate_identifier(owner: &str, name: &str) -> Result<(), Error> {
    if url_canon::is_valid_owner_or_name_segment(owner) && url_canon::is_valid_owner_or_name_segment(name) {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier(owner.to_owned(), name.to_owned()))
    }
}

fn is_retriable(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn reset_epoch_from_headers(headers: &header::HeaderMap) -> Option<i64> {
    headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
}

fn validate_base_url(url: &Url, allow_private_host: bool) -> Result<(), Error> {
    if allow_private_host {
        url.host_str().ok_or_else(|| Error::InvalidBaseUrl("missing host".into()))?;
        return Ok(());
    }

    if url.scheme() != "https" {
        return Err(Error::InvalidBaseUrl("scheme must be https".into()));
    }

    let host = url.host_str().ok_or_else(|| Error::InvalidBaseUrl("missing host".into()))?;

    if let Ok(ip) = host.parse::<IpAddr>() {
        if ip.is_loopback() || is_private(&ip) {
            return Err(Error::InvalidBaseUrl(format!("{host} is a loopback/private address")));
        }
    } else if host.eq_ignore_ascii_case("localhost") {
        return Err(Error::InvalidBaseUrl("localhost is not a valid forge host".into()));
    }

    Ok(())
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_unique_local() || v6.is_unicast_link_local(),
    }
}

/// Avoids pulling in a wall-clock dependency in this crate just for a
/// suspend-until calculation; callers pass absolute reset epochs that this
/// only ever subtracts against `now`, so a process-local clock is exact
/// enough at second resolution.
fn chrono_like_now_epoch() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Deserialize)]
struct RestRepo {
    description: Option<String>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    archived: bool,
}

#[derive(Debug, Deserialize)]
struct GraphQlRepo {
    description: Option<String>,
    #[serde(rename = "isPrivate", default)]
    is_private: bool,
    #[serde(rename = "isArchived", default)]
    is_archived: bool,
}

#[derive(Debug, Deserialize)]
struct RestRateLimit {
    resources: RestRateLimitResources,
}

#[derive(Debug, Deserialize)]
struct RestRateLimitResources {
    core: RestRateLimitCore,
}

#[derive(Debug, Deserialize)]
struct RestRateLimitCore {
    limit: u32,
    remaining: u32,
    reset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> Client {
        let base = Url::parse(&format!("{}/", server.uri())).unwrap();
        Client::with_options(base, Some("test-token".into()), None, true).unwrap()
    }

    #[test]
    fn rejects_non_https_base_url() {
        let url = Url::parse("http://api.github.com").unwrap();
        assert!(matches!(Client::new(url, None), Err(Error::InvalidBaseUrl(_))));
    }

    #[test]
    fn rejects_private_host_without_override() {
        let url = Url::parse("https://127.0.0.1").unwrap();
        assert!(matches!(Client::new(url, None), Err(Error::InvalidBaseUrl(_))));
    }

    #[test]
    fn rejects_invalid_identifier_before_any_network_call() {
        assert!(validate_identifier("oct%2focat", "repo").is_err());
        assert!(validate_identifier("octocat", "repo; DROP").is_err());
        assert!(validate_identifier("octocat", "repo").is_ok());
    }

    #[tokio::test]
    async fn get_repo_returns_not_found_as_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octocat/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let info = client.get_repo("octocat", "missing").await.unwrap();
        assert!(info.not_found);
    }

    #[tokio::test]
    async fn get_repo_parses_success_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octocat/hello-world"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "description": "hi",
                "private": false,
                "archived": true,
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let info = client.get_repo("octocat", "hello-world").await.unwrap();
        assert_eq!(info.description.as_deref(), Some("hi"));
        assert!(!info.private);
        assert!(info.archived);
        assert!(!info.not_found);
    }

    #[tokio::test]
    async fn rate_limited_response_is_surfaced_and_suspends_further_calls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octocat/hello-world"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("x-ratelimit-reset", &(chrono_like_now_epoch() + 1).to_string()),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client.get_repo("octocat", "hello-world").await;
        assert!(matches!(result, Err(Error::RateLimited { .. })));
    }
}
