use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::histogram;
use serde::Deserialize;
use std::time::Duration;

use super::{IdentityResolver, SourceFetcher};
use crate::config::FetchConfig;
use crate::error::PatrolError;
use crate::source::{Item, SourceKind, SourceQuery};

/// Bearer token for the gateway, read from the environment (or `.env`).
pub const ENV_API_TOKEN: &str = "PATROL_API_TOKEN";

#[derive(Debug, Deserialize)]
struct PostsEnvelope {
    #[serde(default)]
    data: Vec<Post>,
}

#[derive(Debug, Deserialize)]
struct Post {
    id: String,
    #[serde(default)]
    author_id: String,
    #[serde(default)]
    text: String,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    like_count: u64,
    #[serde(default)]
    retweet_count: u64,
    /// Precomputed score wins over raw counts when the gateway sends one.
    engagement_score: Option<f64>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserEnvelope {
    data: Option<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    username: String,
}

fn parse_posts(body: &str) -> Result<Vec<Item>> {
    let env: PostsEnvelope = serde_json::from_str(body).context("parsing posts json")?;
    Ok(env
        .data
        .into_iter()
        .filter(|p| !p.id.trim().is_empty())
        .map(|p| Item {
            engagement_score: p
                .engagement_score
                .unwrap_or_else(|| Item::engagement_from_counts(p.like_count, p.retweet_count)),
            timestamp: p.created_at.unwrap_or_else(Utc::now),
            id: p.id,
            author_id: p.author_id,
            text: p.text,
            url: p.url,
        })
        .collect())
}

/// JSON gateway client implementing both fetch capabilities:
///
/// - `GET {base}/search?q=..&max_results=..`
/// - `GET {base}/accounts/{handle}/posts?max_results=..`
/// - `GET {base}/users/{id}` (404 means unknown id)
pub struct HttpFetcher {
    base: String,
    client: reqwest::Client,
    token: Option<String>,
    keyword_max_results: u32,
    account_max_results: u32,
}

impl HttpFetcher {
    pub fn from_config(cfg: &FetchConfig) -> Result<Self> {
        let base = cfg
            .base_url
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| PatrolError::Config("fetch.base_url is not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .user_agent(concat!("scout-patrol/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building http client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
            token: std::env::var(ENV_API_TOKEN).ok().filter(|t| !t.is_empty()),
            keyword_max_results: cfg.keyword_max_results,
            account_max_results: cfg.account_max_results,
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.get(url);
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Item>> {
        let t0 = std::time::Instant::now();
        let req = match query.key.kind {
            SourceKind::Keyword => self.get(&format!("{}/search", self.base)).query(&[
                ("q", query.query.clone()),
                ("max_results", self.keyword_max_results.to_string()),
            ]),
            SourceKind::Account => self
                .get(&format!("{}/accounts/{}/posts", self.base, query.query))
                .query(&[("max_results", self.account_max_results.to_string())]),
        };
        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(
                    target: "patrol",
                    error = ?e,
                    source = %query.key,
                    "gateway http error"
                );
                return Err(e).context("gateway get()");
            }
        };
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("gateway returned {status} for {}", query.key));
        }
        let body = resp.text().await.context("gateway .text()")?;
        let items = parse_posts(&body)?;
        histogram!("patrol_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(items)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[async_trait]
impl IdentityResolver for HttpFetcher {
    async fn resolve(&self, raw_id: &str) -> Result<Option<String>> {
        let resp = self
            .get(&format!("{}/users/{}", self.base, raw_id))
            .send()
            .await
            .context("gateway users get()")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("gateway returned {status} resolving {raw_id}"));
        }
        let user: UserEnvelope = resp.json().await.context("parsing user json")?;
        Ok(user.data.map(|u| u.username).filter(|u| !u.trim().is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posts_fall_back_to_weighted_counts() {
        let body = r#"{"data":[
            {"id":"1","author_id":"42","text":"hi","created_at":"2026-10-01T08:00:00Z",
             "like_count":100,"retweet_count":10},
            {"id":"2","author_id":"43","engagement_score":7.5},
            {"id":"  ","author_id":"44"}
        ]}"#;
        let items = parse_posts(body).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].engagement_score, 130.0);
        assert_eq!(items[0].author_id, "42");
        assert_eq!(items[1].engagement_score, 7.5);
    }

    #[test]
    fn empty_envelope_is_no_items() {
        assert!(parse_posts("{}").unwrap().is_empty());
        assert!(parse_posts("not json").is_err());
    }

    #[test]
    fn missing_base_url_is_config_error() {
        let err = HttpFetcher::from_config(&FetchConfig::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("base_url"));
    }
}
