//! Owner-scoped keyword search over the full-text index.
//!
//! Any document with a full-text entry is searchable, including one whose
//! embedding later failed; semantic retrieval is stricter (see
//! [`crate::query`]).

use serde::Serialize;

use crate::error::{Error, Result};
use crate::index::SearchHit;
use crate::services::Services;

pub const DEFAULT_PAGE_LIMIT: i64 = 10;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub results: Vec<SearchHit>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

#[derive(Clone)]
pub struct SearchService {
    svc: Services,
}

impl SearchService {
    pub fn new(svc: Services) -> Self {
        Self { svc }
    }

    /// One page of `user_id`'s documents matching `query`, best first.
    /// `page` is 1-based; `limit` is clamped to `[1, search_page_limit_max]`.
    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        page: Option<i64>,
        limit: Option<i64>,
    ) -> Result<SearchResults> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(Error::Validation("userId is required".into()));
        }
        if query.trim().is_empty() {
            return Err(Error::Validation("q is required".into()));
        }
        let page = page.unwrap_or(1);
        if page < 1 {
            return Err(Error::Validation("page must be >= 1".into()));
        }
        let max = self.svc.config.retrieval.search_page_limit_max;
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, max.max(1));
        let offset = (page - 1)
            .checked_mul(limit)
            .ok_or_else(|| Error::Validation("page is out of range".into()))?;

        let found = self
            .svc
            .indexer
            .fulltext
            .search(user_id, query, offset, limit)
            .await?;

        tracing::debug!(user_id, query, total = found.total, page, "search");
        Ok(SearchResults {
            results: found.hits,
            total: found.total,
            page,
            limit,
        })
    }
}
