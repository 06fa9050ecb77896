//! Lead and crawl-progress persistence.
//!
//! Both stores follow a read-modify-save discipline over whole documents;
//! there is no optimistic concurrency check, so the pipeline assumes a single
//! runner at a time.

use std::collections::HashMap;

use async_trait::async_trait;
use ilg_core::{CrawlProgress, Lead};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

pub const CRATE_NAME: &str = "ilg-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("document serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Deduplicated company store: at most one lead per distinct company name.
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn find_by_company(&self, company_name: &str) -> Result<Option<Lead>, StoreError>;
    async fn all(&self) -> Result<Vec<Lead>, StoreError>;
    /// Upsert by company name.
    async fn save(&self, lead: &Lead) -> Result<(), StoreError>;
    /// Bulk purge; returns the number of deleted leads.
    async fn delete_all(&self) -> Result<u64, StoreError>;
}

/// Crawl checkpoint store, one record per calendar date.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn find_by_date(&self, date: &str) -> Result<Option<CrawlProgress>, StoreError>;
    /// Upsert by date.
    async fn save(&self, progress: &CrawlProgress) -> Result<(), StoreError>;
}

/// In-memory store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    leads: Mutex<HashMap<String, Lead>>,
    progress: Mutex<HashMap<String, CrawlProgress>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn find_by_company(&self, company_name: &str) -> Result<Option<Lead>, StoreError> {
        Ok(self.leads.lock().await.get(company_name).cloned())
    }

    async fn all(&self) -> Result<Vec<Lead>, StoreError> {
        let mut leads: Vec<Lead> = self.leads.lock().await.values().cloned().collect();
        leads.sort_by(|a, b| a.company_name.cmp(&b.company_name));
        Ok(leads)
    }

    async fn save(&self, lead: &Lead) -> Result<(), StoreError> {
        self.leads
            .lock()
            .await
            .insert(lead.company_name.clone(), lead.clone());
        Ok(())
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let mut leads = self.leads.lock().await;
        let count = leads.len() as u64;
        leads.clear();
        Ok(count)
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn find_by_date(&self, date: &str) -> Result<Option<CrawlProgress>, StoreError> {
        Ok(self.progress.lock().await.get(date).cloned())
    }

    async fn save(&self, progress: &CrawlProgress) -> Result<(), StoreError> {
        self.progress
            .lock()
            .await
            .insert(progress.date.clone(), progress.clone());
        Ok(())
    }
}

/// Postgres-backed document store: one JSONB document per record, keyed by
/// the business key (company name / crawl date).
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotent DDL, run at startup.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leads (
                company_name TEXT PRIMARY KEY,
                data JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS crawl_progress (
                date TEXT PRIMARY KEY,
                data JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        info!("store schema ensured");
        Ok(())
    }
}

#[async_trait]
impl LeadStore for PgStore {
    async fn find_by_company(&self, company_name: &str) -> Result<Option<Lead>, StoreError> {
        let row = sqlx::query("SELECT data FROM leads WHERE company_name = $1")
            .bind(company_name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn all(&self) -> Result<Vec<Lead>, StoreError> {
        let rows = sqlx::query("SELECT data FROM leads ORDER BY company_name")
            .fetch_all(&self.pool)
            .await?;
        let mut leads = Vec::with_capacity(rows.len());
        for row in rows {
            let data: serde_json::Value = row.try_get("data")?;
            leads.push(serde_json::from_value(data)?);
        }
        Ok(leads)
    }

    async fn save(&self, lead: &Lead) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO leads (company_name, data) VALUES ($1, $2)
            ON CONFLICT (company_name) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(&lead.company_name)
        .bind(serde_json::to_value(lead)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM leads").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ProgressStore for PgStore {
    async fn find_by_date(&self, date: &str) -> Result<Option<CrawlProgress>, StoreError> {
        let row = sqlx::query("SELECT data FROM crawl_progress WHERE date = $1")
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, progress: &CrawlProgress) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO crawl_progress (date, data) VALUES ($1, $2)
            ON CONFLICT (date) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(&progress.date)
        .bind(serde_json::to_value(progress)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ilg_core::Job;

    #[tokio::test]
    async fn save_is_an_upsert_by_company_name() {
        let store = MemoryStore::new();
        let mut lead = Lead::new("Acme", "Berlin");
        LeadStore::save(&store, &lead).await.unwrap();

        lead.add_job(Job {
            title: "Nurse".to_string(),
            link: "https://de.indeed.com/viewjob?jk=1".to_string(),
            posted_at: Utc::now(),
        });
        LeadStore::save(&store, &lead).await.unwrap();

        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].jobs.len(), 1);
    }

    #[tokio::test]
    async fn delete_all_reports_the_purged_count() {
        let store = MemoryStore::new();
        LeadStore::save(&store, &Lead::new("Acme", "Berlin"))
            .await
            .unwrap();
        LeadStore::save(&store, &Lead::new("NewCo", "Hamburg"))
            .await
            .unwrap();
        assert_eq!(store.delete_all().await.unwrap(), 2);
        assert!(store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn progress_round_trips_by_date() {
        let store = MemoryStore::new();
        assert!(store.find_by_date("2024-10-05").await.unwrap().is_none());

        let mut progress = CrawlProgress::new("2024-10-05");
        progress.mark_complete("Nurse", 4);
        ProgressStore::save(&store, &progress).await.unwrap();

        let loaded = store.find_by_date("2024-10-05").await.unwrap().unwrap();
        assert!(loaded.is_complete("Nurse"));
    }
}
