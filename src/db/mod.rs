//! Persistence layer: pool setup plus one repository module per table family.
//!
//! Reads take `&Pool`; writes that must compose with other writes take a
//! `&mut Transaction<'_, Sqlite>` and carry a `_tx` suffix.

pub mod assignments;
pub mod audit;
pub mod batches;
pub mod collateral;
pub mod companies;
pub mod contacts;
pub mod notifications;
mod pool;
pub mod segments;
pub mod users;

pub use pool::{init_memory_pool, init_pool, run_migrations, Pool};

use serde::{Deserialize, Serialize};

pub const MAX_PAGE_SIZE: i64 = 100;
const DEFAULT_PAGE_SIZE: i64 = 50;

/// `skip`/`limit` query parameters; `limit` is clamped to `1..=100`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    DEFAULT_PAGE_SIZE
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Paging {
    pub fn skip(&self) -> i64 {
        self.skip.max(0)
    }

    pub fn limit(&self) -> i64 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Serialize)]
pub struct ListPage<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub skip: i64,
    pub limit: i64,
}

impl<T> ListPage<T> {
    pub fn new(items: Vec<T>, total: i64, paging: Paging) -> Self {
        Self {
            items,
            total,
            skip: paging.skip(),
            limit: paging.limit(),
        }
    }
}

/// `%term%` for a LIKE filter, with LIKE wildcards escaped (`ESCAPE '\'`).
pub(crate) fn like_pattern(term: &str) -> String {
    let escaped = term
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_clamps_limit() {
        let p = Paging { skip: -5, limit: 1000 };
        assert_eq!(p.skip(), 0);
        assert_eq!(p.limit(), MAX_PAGE_SIZE);
        let p = Paging { skip: 10, limit: 0 };
        assert_eq!(p.limit(), 1);
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern(" 50%_off "), "%50\\%\\_off%");
    }
}
