//! Resumable, paced crawl over search-result pages.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use ilg_browser::{random_delay, BrowserSession, PageSession};
use ilg_core::{progress_date_key, CrawlProgress, Job, JobListing, Lead};
use ilg_store::{LeadStore, ProgressStore, StoreError};
use serde::Serialize;
use tracing::{info, warn};
use url::Url;

use crate::PipelineConfig;

const RESULT_CARD_SELECTOR: &str = "td.resultContent";

/// Build the search URL for one term at one page offset. Offsets count in
/// tens; `fromage=1` restricts results to postings from the last day.
pub fn search_url(base: &Url, term: &str, page_index: usize) -> String {
    let query = term.split_whitespace().collect::<Vec<_>>().join("+");
    format!("{base}jobs?q={query}&start={}&fromage=1", page_index * 10)
}

/// The configured terms not yet marked complete in today's checkpoint.
pub fn remaining_terms(terms: &[String], progress: &CrawlProgress) -> Vec<String> {
    terms
        .iter()
        .filter(|t| !progress.is_complete(t))
        .cloned()
        .collect()
}

/// How one pagination round ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Listings found and a next page exists; advance the cursor.
    Continue,
    /// Listings found but no next-page link; the term is done.
    Exhausted,
    /// An entirely empty round; the term is done, no probe performed.
    Empty,
}

/// Decide a round's outcome. An empty round terminates the term outright;
/// the next-page probe is consulted only when the round produced listings.
pub async fn round_outcome<F, Fut>(listing_count: usize, probe_next: F) -> RoundOutcome
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    if listing_count == 0 {
        return RoundOutcome::Empty;
    }
    if probe_next().await {
        RoundOutcome::Continue
    } else {
        RoundOutcome::Exhausted
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlSummary {
    pub attempts: u32,
    pub terms_completed: usize,
    pub jobs_added: u32,
}

pub struct Crawler {
    config: PipelineConfig,
    leads: Arc<dyn LeadStore>,
    progress: Arc<dyn ProgressStore>,
}

impl Crawler {
    pub fn new(
        config: PipelineConfig,
        leads: Arc<dyn LeadStore>,
        progress: Arc<dyn ProgressStore>,
    ) -> Self {
        Self {
            config,
            leads,
            progress,
        }
    }

    /// Run the crawl over all configured terms, retrying the whole session a
    /// bounded number of times. Completed terms are checkpointed per date, so
    /// a retry (or a rerun the same day) skips work already done.
    pub async fn run(&self) -> Result<CrawlSummary> {
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.run_attempt(start).await {
                Ok(mut summary) => {
                    summary.attempts = attempt;
                    return Ok(summary);
                }
                Err(err) if attempt < self.config.run_retry_limit => {
                    warn!(attempt, error = ?err, "crawl attempt failed, restarting session");
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("crawl failed after {attempt} attempts"));
                }
            }
        }
    }

    async fn run_attempt(&self, start: Instant) -> Result<CrawlSummary> {
        let base_url = Url::parse(&self.config.base_url)
            .with_context(|| format!("parsing base url {}", self.config.base_url))?;
        let session = BrowserSession::launch(self.config.session_config())
            .await
            .context("launching browser")?;
        let result = self.crawl_terms(&session, &base_url, start).await;
        if let Err(err) = session.close().await {
            warn!(error = %err, "browser session did not shut down cleanly");
        }
        result
    }

    async fn crawl_terms(
        &self,
        session: &BrowserSession,
        base_url: &Url,
        start: Instant,
    ) -> Result<CrawlSummary> {
        let today = progress_date_key(Utc::now());
        let mut progress = self
            .progress
            .find_by_date(&today)
            .await?
            .unwrap_or_else(|| CrawlProgress::new(&today));

        let terms = remaining_terms(&self.config.search_terms, &progress);
        if terms.is_empty() {
            info!(date = %today, "all search terms already crawled");
            return Ok(CrawlSummary::default());
        }
        info!(date = %today, remaining = terms.len(), "starting crawl");

        let mut summary = CrawlSummary::default();
        for (index, term) in terms.iter().enumerate() {
            info!(term = %term, position = index + 1, total = terms.len(), "crawling term");
            let added = self.crawl_term(session, base_url, term).await?;
            progress.mark_complete(term.clone(), added);
            self.progress
                .save(&progress)
                .await
                .context("saving crawl progress")?;
            summary.terms_completed += 1;
            summary.jobs_added += added;
            info!(
                term = %term,
                jobs_added = added,
                elapsed_secs = start.elapsed().as_secs(),
                "term finished"
            );
        }
        Ok(summary)
    }

    /// Paginate one term in concurrent rounds until a round comes back empty
    /// or the first page of the round carries no next-page link.
    async fn crawl_term(
        &self,
        session: &BrowserSession,
        base_url: &Url,
        term: &str,
    ) -> Result<u32> {
        let round_size = self.config.pages_per_round.max(1);
        let mut cursor = 0usize;
        let mut added = 0u32;
        loop {
            let urls: Vec<String> = (0..round_size)
                .map(|i| search_url(base_url, term, cursor + i))
                .collect();

            let pages = join_all(
                urls.iter()
                    .map(|url| self.scrape_result_page(session, base_url, url)),
            )
            .await;
            let listings: Vec<JobListing> = pages.into_iter().flatten().collect();

            let listing_count = listings.len();
            for listing in listings {
                if self.merge_listing(listing).await {
                    added += 1;
                }
            }

            match round_outcome(listing_count, || self.probe_next_page(session, &urls[0]))
                .await
            {
                RoundOutcome::Empty => {
                    info!(term = %term, cursor, "no listings in this round, term done");
                    return Ok(added);
                }
                RoundOutcome::Exhausted => {
                    info!(term = %term, cursor, "no further pages for this term");
                    return Ok(added);
                }
                RoundOutcome::Continue => {
                    cursor += round_size;
                    random_delay(Duration::from_secs(2), Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// Fetch one result page and extract its cards. Any error degrades to an
    /// empty page so one bad offset never aborts the round.
    async fn scrape_result_page(
        &self,
        session: &BrowserSession,
        base_url: &Url,
        url: &str,
    ) -> Vec<JobListing> {
        match self.scrape_result_page_inner(session, base_url, url).await {
            Ok(listings) => listings,
            Err(err) => {
                warn!(%url, error = ?err, "result page scrape failed");
                Vec::new()
            }
        }
    }

    async fn scrape_result_page_inner(
        &self,
        session: &BrowserSession,
        base_url: &Url,
        url: &str,
    ) -> Result<Vec<JobListing>> {
        let page = session.open_page().await?;
        let outcome = self.fetch_listings(&page, base_url, url).await;
        if let Err(err) = page.close().await {
            warn!(%url, error = %err, "failed to close result page");
        }
        outcome
    }

    async fn fetch_listings(
        &self,
        page: &PageSession,
        base_url: &Url,
        url: &str,
    ) -> Result<Vec<JobListing>> {
        page.goto(url).await?;
        if !page.wait_for_selector(RESULT_CARD_SELECTOR).await {
            return Ok(Vec::new());
        }
        let html = page.content().await?;
        Ok(ilg_extract::extract_listings(&html, base_url, Utc::now())?)
    }

    /// Upsert the listing into the lead store. Returns whether a new job was
    /// recorded; persistence failures are logged and swallowed so one bad
    /// document never aborts the term.
    pub async fn merge_listing(&self, listing: JobListing) -> bool {
        match self.merge_listing_inner(listing).await {
            Ok(added) => added,
            Err(err) => {
                warn!(error = %err, "failed to persist lead");
                false
            }
        }
    }

    async fn merge_listing_inner(&self, listing: JobListing) -> Result<bool, StoreError> {
        let mut lead = self
            .leads
            .find_by_company(&listing.company)
            .await?
            .unwrap_or_else(|| Lead::new(listing.company.clone(), listing.location.clone()));
        let added = lead.add_job(Job {
            title: listing.title,
            link: listing.link,
            posted_at: listing.posted_at,
        });
        self.leads.save(&lead).await?;
        Ok(added)
    }

    /// Revisit the round's first offset and look for the pagination link.
    /// A failed probe reads as "no more pages".
    async fn probe_next_page(&self, session: &BrowserSession, url: &str) -> bool {
        match self.probe_next_page_inner(session, url).await {
            Ok(more) => more,
            Err(err) => {
                warn!(%url, error = ?err, "next-page probe failed");
                false
            }
        }
    }

    async fn probe_next_page_inner(&self, session: &BrowserSession, url: &str) -> Result<bool> {
        let page = session.open_page().await?;
        let outcome = async {
            page.goto(url).await?;
            let html = page.content().await?;
            Ok(ilg_extract::has_next_page(&html)?)
        }
        .await;
        if let Err(err) = page.close().await {
            warn!(%url, error = %err, "failed to close probe page");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ilg_store::MemoryStore;

    fn base() -> Url {
        Url::parse("https://de.indeed.com").unwrap()
    }

    fn crawler(store: Arc<MemoryStore>) -> Crawler {
        Crawler::new(PipelineConfig::default(), store.clone(), store)
    }

    fn listing(title: &str, company: &str) -> JobListing {
        JobListing {
            title: title.to_string(),
            company: company.to_string(),
            location: "Berlin".to_string(),
            link: "https://de.indeed.com/rc/clk?jk=abc".to_string(),
            posted_at: Utc.with_ymd_and_hms(2024, 10, 5, 9, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn search_url_encodes_term_and_offset() {
        let url = search_url(&base(), "Gesundheits- und Krankenpfleger", 3);
        assert_eq!(
            url,
            "https://de.indeed.com/jobs?q=Gesundheits-+und+Krankenpfleger&start=30&fromage=1"
        );
    }

    #[test]
    fn search_url_round_offsets_count_in_tens() {
        assert!(search_url(&base(), "Erzieher", 0).contains("start=0"));
        assert!(search_url(&base(), "Erzieher", 5).contains("start=50"));
    }

    #[test]
    fn remaining_terms_skips_checkpointed_ones() {
        let terms: Vec<String> = ["Pflegefachkraft", "Erzieher", "Altenpfleger"]
            .iter()
            .map(|t| t.to_string())
            .collect();
        let mut progress = CrawlProgress::new("2024-10-05");
        progress.mark_complete("Erzieher", 7);
        assert_eq!(
            remaining_terms(&terms, &progress),
            vec!["Pflegefachkraft".to_string(), "Altenpfleger".to_string()]
        );
    }

    #[tokio::test]
    async fn an_empty_round_terminates_without_probing() {
        let outcome = round_outcome(0, || async { panic!("probe must not run") }).await;
        assert_eq!(outcome, RoundOutcome::Empty);
    }

    #[tokio::test]
    async fn a_populated_round_follows_the_probe() {
        assert_eq!(
            round_outcome(3, || async { true }).await,
            RoundOutcome::Continue
        );
        assert_eq!(
            round_outcome(3, || async { false }).await,
            RoundOutcome::Exhausted
        );
    }

    #[tokio::test]
    async fn merging_the_same_listing_twice_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let crawler = crawler(store.clone());

        assert!(crawler.merge_listing(listing("Nurse", "Acme")).await);
        assert!(!crawler.merge_listing(listing("Nurse", "Acme")).await);

        let leads = LeadStore::all(store.as_ref()).await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].jobs.len(), 1);
    }

    #[tokio::test]
    async fn listings_for_distinct_companies_become_distinct_leads() {
        let store = Arc::new(MemoryStore::new());
        let crawler = crawler(store.clone());

        assert!(crawler.merge_listing(listing("Nurse", "Acme")).await);
        assert!(crawler.merge_listing(listing("Nurse", "NewCo")).await);

        let leads = LeadStore::all(store.as_ref()).await.unwrap();
        assert_eq!(leads.len(), 2);
    }
}
