//! Duplicate detection over a scoped, creation-ordered record set.
//!
//! The earliest record per normalized key stays unflagged; every later record
//! with the same key is flagged. Stale flags on first-seen records are cleared.

use sqlx::{Sqlite, Transaction};
use std::collections::HashSet;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::Result;

pub trait Dedupable {
    fn id(&self) -> Uuid;
    fn dedup_key(&self) -> String;
    fn is_duplicate(&self) -> bool;
}

/// Company key: `lower(trim(name)) || "||" || lower(trim(website))`.
pub fn company_key(name: &str, website: Option<&str>) -> String {
    format!(
        "{}||{}",
        name.trim().to_lowercase(),
        website.unwrap_or("").trim().to_lowercase()
    )
}

/// Contact key: `lower(trim(email))`.
pub fn contact_key(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DedupPlan {
    pub newly_marked: Vec<Uuid>,
    pub cleared: Vec<Uuid>,
}

/// Walks `records` in the given order and decides which flags change.
pub fn plan<T: Dedupable>(records: &[T]) -> DedupPlan {
    let mut seen = HashSet::with_capacity(records.len());
    let mut out = DedupPlan::default();
    for r in records {
        if seen.insert(r.dedup_key()) {
            if r.is_duplicate() {
                out.cleared.push(r.id());
            }
        } else if !r.is_duplicate() {
            out.newly_marked.push(r.id());
        }
    }
    out
}

#[derive(Debug, sqlx::FromRow)]
struct CompanyKeyRow {
    id: Uuid,
    company_name: String,
    company_website: Option<String>,
    is_duplicate: bool,
}

impl Dedupable for CompanyKeyRow {
    fn id(&self) -> Uuid {
        self.id
    }
    fn dedup_key(&self) -> String {
        company_key(&self.company_name, self.company_website.as_deref())
    }
    fn is_duplicate(&self) -> bool {
        self.is_duplicate
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ContactKeyRow {
    id: Uuid,
    email: String,
    is_duplicate: bool,
}

impl Dedupable for ContactKeyRow {
    fn id(&self) -> Uuid {
        self.id
    }
    fn dedup_key(&self) -> String {
        contact_key(&self.email)
    }
    fn is_duplicate(&self) -> bool {
        self.is_duplicate
    }
}

async fn apply_plan_tx(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    plan: &DedupPlan,
) -> Result<()> {
    let now = chrono::Utc::now();
    let mark = format!("UPDATE {table} SET is_duplicate = 1, updated_at = ? WHERE id = ?");
    for id in &plan.newly_marked {
        sqlx::query(&mark).bind(now).bind(id).execute(&mut **tx).await?;
    }
    let clear = format!("UPDATE {table} SET is_duplicate = 0, updated_at = ? WHERE id = ?");
    for id in &plan.cleared {
        sqlx::query(&clear).bind(now).bind(id).execute(&mut **tx).await?;
    }
    Ok(())
}

/// Flags duplicate companies within a segment. Returns the newly marked count.
#[instrument(skip_all, fields(segment_id = %segment_id))]
pub async fn detect_company_duplicates_tx(
    tx: &mut Transaction<'_, Sqlite>,
    segment_id: Uuid,
) -> Result<usize> {
    let rows: Vec<CompanyKeyRow> = sqlx::query_as(
        "SELECT id, company_name, company_website, is_duplicate FROM companies \
         WHERE segment_id = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(segment_id)
    .fetch_all(&mut **tx)
    .await?;
    let plan = plan(&rows);
    apply_plan_tx(tx, "companies", &plan).await?;
    debug!(
        scanned = rows.len(),
        marked = plan.newly_marked.len(),
        cleared = plan.cleared.len(),
        "company duplicate scan"
    );
    Ok(plan.newly_marked.len())
}

/// Flags duplicate contacts within a company. Returns the newly marked count.
#[instrument(skip_all, fields(company_id = %company_id))]
pub async fn detect_contact_duplicates_tx(
    tx: &mut Transaction<'_, Sqlite>,
    company_id: Uuid,
) -> Result<usize> {
    let rows: Vec<ContactKeyRow> = sqlx::query_as(
        "SELECT id, email, is_duplicate FROM contacts \
         WHERE company_id = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(company_id)
    .fetch_all(&mut **tx)
    .await?;
    let plan = plan(&rows);
    apply_plan_tx(tx, "contacts", &plan).await?;
    debug!(
        scanned = rows.len(),
        marked = plan.newly_marked.len(),
        cleared = plan.cleared.len(),
        "contact duplicate scan"
    );
    Ok(plan.newly_marked.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rec {
        id: Uuid,
        key: &'static str,
        dup: bool,
    }

    impl Dedupable for Rec {
        fn id(&self) -> Uuid {
            self.id
        }
        fn dedup_key(&self) -> String {
            self.key.to_string()
        }
        fn is_duplicate(&self) -> bool {
            self.dup
        }
    }

    fn rec(key: &'static str, dup: bool) -> Rec {
        Rec {
            id: Uuid::new_v4(),
            key,
            dup,
        }
    }

    #[test]
    fn keys_are_normalized() {
        assert_eq!(company_key("  Acme ", Some("ACME.com ")), "acme||acme.com");
        assert_eq!(company_key("Acme", None), "acme||");
        assert_eq!(contact_key(" Ada@Example.COM"), "ada@example.com");
    }

    #[test]
    fn earliest_wins_and_later_are_marked() {
        let recs = vec![rec("a", false), rec("b", false), rec("a", false), rec("a", true)];
        let p = plan(&recs);
        assert_eq!(p.newly_marked, vec![recs[2].id]);
        assert!(p.cleared.is_empty());
    }

    #[test]
    fn stale_flag_on_first_seen_is_cleared() {
        let recs = vec![rec("a", true), rec("a", true)];
        let p = plan(&recs);
        assert_eq!(p.cleared, vec![recs[0].id]);
        assert!(p.newly_marked.is_empty());
    }

    #[test]
    fn rerun_on_settled_set_is_noop() {
        let recs = vec![rec("a", false), rec("a", true), rec("b", false)];
        assert_eq!(plan(&recs), DedupPlan::default());
    }

    #[test]
    fn blank_keys_collide() {
        let recs = vec![rec("||", false), rec("||", false)];
        assert_eq!(plan(&recs).newly_marked.len(), 1);
    }
}
