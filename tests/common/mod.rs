// tests/common/mod.rs
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use scout_patrol::source::SourceQuery;
use scout_patrol::{IdentityResolver, Item, PatrolConfig, SourceFetcher};

pub enum Reply {
    Items(Vec<Item>),
    Fail(&'static str),
    Hang(Duration),
}

/// Scripted fetcher: each source id pops one reply per call; an exhausted
/// script answers with no items.
#[derive(Default)]
pub struct MockFetcher {
    script: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, id: &str, reply: Reply) -> &Self {
        self.script
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Ids fetched so far, sorted (fan-out order is not deterministic).
    pub fn take_calls(&self) -> Vec<String> {
        let mut c = std::mem::take(&mut *self.calls.lock().unwrap());
        c.sort();
        c
    }
}

#[async_trait]
impl SourceFetcher for MockFetcher {
    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Item>> {
        self.calls.lock().unwrap().push(query.key.id.clone());
        let reply = self
            .script
            .lock()
            .unwrap()
            .get_mut(&query.key.id)
            .and_then(|q| q.pop_front());
        match reply {
            None => Ok(Vec::new()),
            Some(Reply::Items(items)) => Ok(items),
            Some(Reply::Fail(msg)) => bail!("{msg}"),
            Some(Reply::Hang(d)) => {
                tokio::time::sleep(d).await;
                Ok(Vec::new())
            }
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

pub struct MapResolver(pub HashMap<String, String>);

#[async_trait]
impl IdentityResolver for MapResolver {
    async fn resolve(&self, raw_id: &str) -> Result<Option<String>> {
        Ok(self.0.get(raw_id).cloned())
    }
}

pub fn item(id: &str, author: &str, score: f64) -> Item {
    Item {
        id: id.to_string(),
        author_id: author.to_string(),
        engagement_score: score,
        timestamp: Utc::now(),
        text: format!("post {id}"),
        url: None,
    }
}

pub fn config_in(dir: &std::path::Path) -> PatrolConfig {
    let mut cfg = PatrolConfig::default();
    cfg.state_dir = dir.to_path_buf();
    cfg
}
