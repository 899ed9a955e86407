//! Per-agent session cache: recent result sets (identifiers plus the query
//! or pipeline that produced them) and a detail map of full articles. The
//! literal token `last` resolves to the newest result set. Bounded by
//! count and idle age; eviction is insertion-order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::debug;

use crate::entities::UnifiedArticle;
use crate::error::LitMcpError;

pub const LAST_TOKEN: &str = "last";

pub const DEFAULT_MAX_RESULT_SETS: usize = 20;
pub const DEFAULT_MAX_DETAILS: usize = 500;
pub const DEFAULT_MAX_IDLE: time::Duration = time::Duration::hours(24);

#[derive(Debug, Clone, Serialize)]
pub struct RecentResultSet {
    pub ids: Vec<String>,
    /// The query text or pipeline name that produced the set.
    pub origin: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Debug)]
struct Session {
    result_sets: VecDeque<RecentResultSet>,
    details: HashMap<String, UnifiedArticle>,
    detail_order: VecDeque<String>,
    last_activity: OffsetDateTime,
}

impl Session {
    fn new(now: OffsetDateTime) -> Self {
        Self {
            result_sets: VecDeque::new(),
            details: HashMap::new(),
            detail_order: VecDeque::new(),
            last_activity: now,
        }
    }
}

pub struct SessionCache {
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
    max_result_sets: usize,
    max_details: usize,
    max_idle: time::Duration,
    minted: AtomicU64,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::with_bounds(DEFAULT_MAX_RESULT_SETS, DEFAULT_MAX_DETAILS, DEFAULT_MAX_IDLE)
    }
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bounds(
        max_result_sets: usize,
        max_details: usize,
        max_idle: time::Duration,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_result_sets: max_result_sets.max(1),
            max_details: max_details.max(1),
            max_idle,
            minted: AtomicU64::new(0),
        }
    }

    /// Session id for callers that did not supply one.
    pub fn mint_session_id(&self) -> String {
        let n = self.minted.fetch_add(1, Ordering::Relaxed);
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
        format!("sess-{stamp:x}-{n}")
    }

    async fn session(&self, session_id: &str, now: OffsetDateTime) -> Arc<Mutex<Session>> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(now))))
            .clone()
    }

    async fn existing(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Record one result set and its article details.
    pub async fn record_results(
        &self,
        session_id: &str,
        origin: &str,
        articles: &[UnifiedArticle],
    ) {
        self.record_results_at(session_id, origin, articles, OffsetDateTime::now_utc())
            .await
    }

    pub async fn record_results_at(
        &self,
        session_id: &str,
        origin: &str,
        articles: &[UnifiedArticle],
        now: OffsetDateTime,
    ) {
        let session = self.session(session_id, now).await;
        let mut session = session.lock().await;
        session.last_activity = now;

        let ids: Vec<String> = articles.iter().map(|a| a.primary_id()).collect();
        session.result_sets.push_back(RecentResultSet {
            ids,
            origin: origin.to_string(),
            at: now,
        });
        while session.result_sets.len() > self.max_result_sets {
            session.result_sets.pop_front();
        }

        for article in articles {
            let key = article.primary_id();
            if key.is_empty() {
                continue;
            }
            if !session.details.contains_key(&key) {
                session.detail_order.push_back(key.clone());
            }
            session.details.insert(key, article.clone());
        }
        while session.detail_order.len() > self.max_details {
            if let Some(evicted) = session.detail_order.pop_front() {
                session.details.remove(&evicted);
                debug!(session = session_id, id = %evicted, "evicted cached detail");
            }
        }
    }

    /// Expand an id list, replacing the `last` token with the newest result
    /// set's identifiers.
    pub async fn resolve_ids(
        &self,
        session_id: &str,
        ids: &[String],
    ) -> Result<Vec<String>, LitMcpError> {
        let mut out = Vec::new();
        for id in ids {
            if id.trim().eq_ignore_ascii_case(LAST_TOKEN) {
                let last = self.last_ids(session_id).await?;
                out.extend(last);
            } else {
                out.push(id.trim().to_string());
            }
        }
        Ok(out)
    }

    pub async fn last_ids(&self, session_id: &str) -> Result<Vec<String>, LitMcpError> {
        let Some(session) = self.existing(session_id).await else {
            return Err(LitMcpError::not_found(
                "session",
                session_id,
                "Run a search first.",
            ));
        };
        let session = session.lock().await;
        session
            .result_sets
            .back()
            .map(|set| set.ids.clone())
            .ok_or_else(|| {
                LitMcpError::not_found(
                    "result set",
                    format!("{session_id}/{LAST_TOKEN}"),
                    "Run a search first.",
                )
            })
    }

    pub async fn recent_sets(&self, session_id: &str) -> Vec<RecentResultSet> {
        match self.existing(session_id).await {
            Some(session) => session.lock().await.result_sets.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub async fn get_detail(&self, session_id: &str, id: &str) -> Option<UnifiedArticle> {
        let session = self.existing(session_id).await?;
        let session = session.lock().await;
        session.details.get(id).cloned()
    }

    pub async fn details_for(
        &self,
        session_id: &str,
        ids: &[String],
    ) -> Vec<UnifiedArticle> {
        match self.existing(session_id).await {
            Some(session) => {
                let session = session.lock().await;
                ids.iter()
                    .filter_map(|id| session.details.get(id).cloned())
                    .collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop sessions idle past the age bound. Returns how many were
    /// discarded.
    pub async fn sweep_idle(&self, now: OffsetDateTime) -> usize {
        let mut sessions = self.sessions.lock().await;
        let mut stale = Vec::new();
        for (id, session) in sessions.iter() {
            if let Ok(session) = session.try_lock()
                && now - session.last_activity > self.max_idle
            {
                stale.push(id.clone());
            }
        }
        for id in &stale {
            sessions.remove(id);
            debug!(session = %id, "discarded idle session");
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Provenance, PubDate};
    use crate::sources::SourceId;
    use std::collections::BTreeMap;

    fn article(pmid: &str) -> UnifiedArticle {
        UnifiedArticle {
            pmid: Some(pmid.to_string()),
            pmcid: None,
            doi: None,
            other_ids: BTreeMap::new(),
            title: format!("Article {pmid}"),
            abstract_text: None,
            authors: Vec::new(),
            journal: None,
            pub_date: PubDate::year(2024),
            publication_types: Vec::new(),
            language: None,
            mesh_terms: Vec::new(),
            links: Vec::new(),
            citation_count: None,
            influential_citations: None,
            impact: None,
            provenance: vec![Provenance::now(SourceId::Pubmed, pmid)],
        }
    }

    #[tokio::test]
    async fn last_resolves_to_the_newest_result_set() {
        let cache = SessionCache::new();
        cache
            .record_results("s1", "query one", &[article("1"), article("2")])
            .await;
        cache.record_results("s1", "query two", &[article("3")]).await;

        let ids = cache
            .resolve_ids("s1", &["last".to_string()])
            .await
            .unwrap();
        assert_eq!(ids, vec!["pmid:3"]);

        let mixed = cache
            .resolve_ids("s1", &["pmid:9".to_string(), "LAST".to_string()])
            .await
            .unwrap();
        assert_eq!(mixed, vec!["pmid:9", "pmid:3"]);
    }

    #[tokio::test]
    async fn last_without_history_is_not_found() {
        let cache = SessionCache::new();
        let err = cache
            .resolve_ids("nope", &["last".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, LitMcpError::NotFound { .. }));
    }

    #[tokio::test]
    async fn result_set_bound_evicts_oldest_first() {
        let cache = SessionCache::with_bounds(2, 10, DEFAULT_MAX_IDLE);
        cache.record_results("s1", "a", &[article("1")]).await;
        cache.record_results("s1", "b", &[article("2")]).await;
        cache.record_results("s1", "c", &[article("3")]).await;

        let sets = cache.recent_sets("s1").await;
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].origin, "b");
        assert_eq!(sets[1].origin, "c");
    }

    #[tokio::test]
    async fn detail_bound_evicts_in_insertion_order() {
        let cache = SessionCache::with_bounds(10, 2, DEFAULT_MAX_IDLE);
        cache
            .record_results("s1", "a", &[article("1"), article("2"), article("3")])
            .await;

        assert!(cache.get_detail("s1", "pmid:1").await.is_none());
        assert!(cache.get_detail("s1", "pmid:2").await.is_some());
        assert!(cache.get_detail("s1", "pmid:3").await.is_some());
    }

    #[tokio::test]
    async fn idle_sessions_are_discarded_whole() {
        let cache = SessionCache::new();
        let old = OffsetDateTime::now_utc() - time::Duration::hours(30);
        cache
            .record_results_at("stale", "q", &[article("1")], old)
            .await;
        cache.record_results("fresh", "q", &[article("2")]).await;

        let swept = cache.sweep_idle(OffsetDateTime::now_utc()).await;
        assert_eq!(swept, 1);
        assert!(cache.last_ids("stale").await.is_err());
        assert!(cache.last_ids("fresh").await.is_ok());
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let cache = SessionCache::new();
        cache.record_results("a", "q", &[article("1")]).await;
        cache.record_results("b", "q", &[article("2")]).await;
        assert_eq!(cache.last_ids("a").await.unwrap(), vec!["pmid:1"]);
        assert_eq!(cache.last_ids("b").await.unwrap(), vec!["pmid:2"]);
    }

    #[test]
    fn minted_ids_are_unique() {
        let cache = SessionCache::new();
        let a = cache.mint_session_id();
        let b = cache.mint_session_id();
        assert_ne!(a, b);
    }
}
