//! Company-profile enrichment of unenriched leads, in concurrent batches.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::future::join_all;
use ilg_browser::{is_valid_url, navigate_with_retry, random_delay, BrowserSession, PageSession};
use ilg_core::{CompanyProfile, Lead};
use ilg_store::LeadStore;
use serde::Serialize;
use tracing::{info, warn};
use url::Url;

use crate::PipelineConfig;

/// Completion-percentage step after which the enricher takes one longer
/// pause. The step shrinks as the lead count grows so the long pauses stay
/// roughly evenly spread over the run.
pub fn threshold_step(total_leads: usize) -> f64 {
    if total_leads <= 100 {
        20.0
    } else if total_leads <= 500 {
        10.0
    } else if total_leads <= 1000 {
        5.0
    } else {
        2.5
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichSummary {
    pub total_leads: usize,
    pub enriched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub elapsed_secs: f64,
}

enum EnrichStatus {
    Enriched,
    Skipped,
    Failed,
}

pub struct Enricher {
    config: PipelineConfig,
    leads: Arc<dyn LeadStore>,
}

impl Enricher {
    pub fn new(config: PipelineConfig, leads: Arc<dyn LeadStore>) -> Self {
        Self { config, leads }
    }

    /// Enrich every lead still flagged unenriched. Failures leave the lead
    /// unenriched for a future run; the batch and the run continue.
    pub async fn run(&self) -> Result<EnrichSummary> {
        let start = Instant::now();
        let base_url = Url::parse(&self.config.base_url)
            .with_context(|| format!("parsing base url {}", self.config.base_url))?;
        let leads = self.leads.all().await?;
        let total = leads.len();
        info!(total, "starting enrichment");

        let session = BrowserSession::launch(self.config.session_config())
            .await
            .context("launching browser")?;
        let result = self.enrich_all(&session, &base_url, leads, start).await;
        if let Err(err) = session.close().await {
            warn!(error = %err, "browser session did not shut down cleanly");
        }
        result
    }

    async fn enrich_all(
        &self,
        session: &BrowserSession,
        base_url: &Url,
        leads: Vec<Lead>,
        start: Instant,
    ) -> Result<EnrichSummary> {
        let total = leads.len();
        let batch_size = self.config.enrich_batch_size.max(1);
        let step = threshold_step(total);
        let mut summary = EnrichSummary {
            total_leads: total,
            ..EnrichSummary::default()
        };
        let mut processed = 0usize;
        let mut thresholds_crossed = 0u32;

        for batch in leads.chunks(batch_size) {
            let statuses = join_all(
                batch
                    .iter()
                    .map(|lead| self.enrich_lead(session, base_url, lead.clone())),
            )
            .await;
            for status in statuses {
                match status {
                    EnrichStatus::Enriched => summary.enriched += 1,
                    EnrichStatus::Skipped => summary.skipped += 1,
                    EnrichStatus::Failed => summary.failed += 1,
                }
            }
            processed += batch.len();
            let percent = processed as f64 / total as f64 * 100.0;
            info!(processed, total, percent, "enrichment batch done");
            random_delay(Duration::from_secs(1), Duration::from_secs(3)).await;

            let crossed = (percent / step) as u32;
            if crossed > thresholds_crossed {
                thresholds_crossed = crossed;
                info!(percent, "threshold crossed, longer pause");
                random_delay(Duration::from_secs(10), Duration::from_secs(20)).await;
            }
        }

        summary.elapsed_secs = start.elapsed().as_secs_f64();
        Ok(summary)
    }

    async fn enrich_lead(
        &self,
        session: &BrowserSession,
        base_url: &Url,
        mut lead: Lead,
    ) -> EnrichStatus {
        if lead.enriched {
            return EnrichStatus::Skipped;
        }
        let job_link = match lead.most_recent_job() {
            Some(job) if is_valid_url(&job.link) => job.link.clone(),
            _ => return EnrichStatus::Skipped,
        };
        match self
            .enrich_lead_inner(session, base_url, &mut lead, &job_link)
            .await
        {
            Ok(updated) => {
                if updated.is_empty() {
                    info!(company = %lead.company_name, "no new profile fields");
                } else {
                    info!(company = %lead.company_name, fields = ?updated, "profile fields updated");
                }
                EnrichStatus::Enriched
            }
            Err(err) => {
                warn!(company = %lead.company_name, error = ?err, "enrichment failed");
                EnrichStatus::Failed
            }
        }
    }

    async fn enrich_lead_inner(
        &self,
        session: &BrowserSession,
        base_url: &Url,
        lead: &mut Lead,
        job_link: &str,
    ) -> Result<Vec<&'static str>> {
        let page = session.open_page().await?;
        let outcome = self.discover_profile(&page, base_url, job_link).await;
        if let Err(err) = page.close().await {
            warn!(company = %lead.company_name, error = %err, "failed to close enrichment page");
        }
        let updated = match outcome? {
            // A missing profile link or about section is terminal for this
            // lead: marking it enriched guarantees forward progress.
            None => Vec::new(),
            Some((profile_url, profile)) => {
                lead.profile_url = profile_url;
                profile
                    .map(|p| lead.apply_profile(&p))
                    .unwrap_or_default()
            }
        };
        lead.enriched = true;
        self.leads.save(lead).await?;
        Ok(updated)
    }

    async fn discover_profile(
        &self,
        page: &PageSession,
        base_url: &Url,
        job_link: &str,
    ) -> Result<Option<(String, Option<CompanyProfile>)>> {
        navigate_with_retry(page, job_link, 2).await?;
        let html = page.content().await?;
        let Some(profile_url) = ilg_extract::extract_company_profile_url(&html, base_url)? else {
            return Ok(None);
        };
        navigate_with_retry(page, &profile_url, 2).await?;
        let profile = ilg_extract::extract_company_profile(page).await?;
        Ok(Some((profile_url, profile)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_step_shrinks_with_lead_count() {
        assert_eq!(threshold_step(0), 20.0);
        assert_eq!(threshold_step(100), 20.0);
        assert_eq!(threshold_step(101), 10.0);
        assert_eq!(threshold_step(500), 10.0);
        assert_eq!(threshold_step(501), 5.0);
        assert_eq!(threshold_step(1000), 5.0);
        assert_eq!(threshold_step(1001), 2.5);
    }
}
