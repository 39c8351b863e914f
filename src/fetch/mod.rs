//! External capabilities consumed by a run: fetching items for a source and
//! resolving a raw author id to a handle. Both are async trait seams so tests
//! and alternative backends can stand in for [`http::HttpFetcher`].

pub mod http;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::FilterConfig;
use crate::source::{Item, Source, SourceKey, SourceKind, SourceQuery};

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Item>>;
    fn name(&self) -> &'static str;
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `Ok(None)` when the id does not belong to any live account.
    async fn resolve(&self, raw_id: &str) -> Result<Option<String>>;
}

/// Build the descriptor handed to the fetcher. Keyword searches carry the
/// retweet and language filters inline, e.g. `rust async -is:retweet lang:en`.
pub fn build_query(kind: SourceKind, source: &Source, filters: &FilterConfig) -> SourceQuery {
    let key = SourceKey::new(kind, source.id.clone());
    let query = match kind {
        SourceKind::Account => source.id.clone(),
        SourceKind::Keyword => {
            let mut q = source.id.clone();
            let include_rt = source
                .overrides
                .include_retweets
                .unwrap_or(filters.include_retweets);
            if !include_rt {
                q.push_str(" -is:retweet");
            }
            if let Some(lang) = source
                .overrides
                .lang
                .as_deref()
                .or(filters.lang.as_deref())
                .filter(|l| !l.trim().is_empty())
            {
                q.push_str(" lang:");
                q.push_str(lang.trim());
            }
            q
        }
    };
    SourceQuery { key, query }
}

/// Global exclude list merged with the source's own.
pub fn effective_excludes(source: &Source, filters: &FilterConfig) -> Vec<String> {
    let mut out = filters.exclude_keywords.clone();
    for e in &source.overrides.exclude_keywords {
        if !out.iter().any(|x| x.eq_ignore_ascii_case(e)) {
            out.push(e.clone());
        }
    }
    out
}
