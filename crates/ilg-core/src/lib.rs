//! Core domain model for ILG: leads, jobs, company profiles, crawl progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ilg-core";

/// One job posting, embedded in a [`Lead`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub title: String,
    pub link: String,
    pub posted_at: DateTime<Utc>,
}

/// One employer/company, keyed by exact company name.
///
/// Created on first sighting of a posting for an unseen company; jobs are
/// appended by the crawler, metadata fields filled by enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub company_name: String,
    pub location: String,
    pub founded: String,
    pub ceo: String,
    pub headquarters: String,
    pub industry: String,
    /// Canonical external company-profile URL discovered during enrichment.
    pub profile_url: String,
    pub company_url: String,
    pub size: String,
    pub sales_volume: String,
    pub enriched: bool,
    pub jobs: Vec<Job>,
}

impl Lead {
    pub fn new(company_name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            company_name: company_name.into(),
            location: location.into(),
            founded: String::new(),
            ceo: String::new(),
            headquarters: String::new(),
            industry: String::new(),
            profile_url: String::new(),
            company_url: String::new(),
            size: String::new(),
            sales_volume: String::new(),
            enriched: false,
            jobs: Vec::new(),
        }
    }

    /// Append a job unless an entry with the same title and the same calendar
    /// day of posting already exists. Returns whether the job was added.
    pub fn add_job(&mut self, job: Job) -> bool {
        let exists = self.jobs.iter().any(|existing| {
            existing.title == job.title
                && existing.posted_at.date_naive() == job.posted_at.date_naive()
        });
        if exists {
            return false;
        }
        self.jobs.push(job);
        true
    }

    /// The lead's most recently appended job; enrichment navigates to its link.
    pub fn most_recent_job(&self) -> Option<&Job> {
        self.jobs.last()
    }

    /// Change-guarded merge of extracted company metadata: a field is
    /// overwritten only when the extracted value is non-empty and differs from
    /// the stored value. Returns the labels of the fields that changed.
    pub fn apply_profile(&mut self, profile: &CompanyProfile) -> Vec<&'static str> {
        let mut updated = Vec::new();
        let mut merge = |current: &mut String, incoming: &Option<String>, label: &'static str| {
            if let Some(value) = incoming {
                if !value.is_empty() && value != current {
                    *current = value.clone();
                    updated.push(label);
                }
            }
        };
        merge(&mut self.ceo, &profile.ceo, "ceo");
        merge(&mut self.size, &profile.size, "size");
        merge(&mut self.sales_volume, &profile.sales_volume, "sales_volume");
        merge(&mut self.industry, &profile.industry, "industry");
        merge(&mut self.headquarters, &profile.headquarters, "headquarters");
        merge(&mut self.company_url, &profile.company_url, "company_url");
        merge(&mut self.founded, &profile.founded, "founded");
        updated
    }
}

/// Company metadata scraped from the "about" section of a profile page.
/// Every field is optional; absent sections yield no profile at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanyProfile {
    pub ceo: Option<String>,
    pub size: Option<String>,
    pub sales_volume: Option<String>,
    pub industry: Option<String>,
    pub headquarters: Option<String>,
    pub company_url: Option<String>,
    pub founded: Option<String>,
}

/// One extracted search-result card, before it is merged into a [`Lead`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListing {
    pub title: String,
    pub company: String,
    pub location: String,
    pub link: String,
    /// The source page carries no explicit date; "posted today" is assumed.
    pub posted_at: DateTime<Utc>,
}

/// A search term marked fully processed for one crawl date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedTerm {
    pub term: String,
    pub leads_added: u32,
}

/// Checkpoint record for one calendar date: which search terms finished and
/// how many jobs each contributed. Presence of a term means "fully processed".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlProgress {
    pub date: String,
    pub completed: Vec<CompletedTerm>,
}

impl CrawlProgress {
    pub fn new(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            completed: Vec::new(),
        }
    }

    pub fn is_complete(&self, term: &str) -> bool {
        self.completed.iter().any(|c| c.term == term)
    }

    /// Record a term as fully processed. A term appears at most once per
    /// date's record; marking an already-complete term is a no-op.
    pub fn mark_complete(&mut self, term: impl Into<String>, leads_added: u32) {
        let term = term.into();
        if !self.is_complete(&term) {
            self.completed.push(CompletedTerm { term, leads_added });
        }
    }
}

/// UTC-naive "today" key used to group crawl progress, e.g. `2024-10-05`.
pub fn progress_date_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    fn job(title: &str, posted_at: DateTime<Utc>) -> Job {
        Job {
            title: title.to_string(),
            link: "https://de.indeed.com/viewjob?jk=abc".to_string(),
            posted_at,
        }
    }

    #[test]
    fn same_title_same_day_is_deduplicated() {
        let mut lead = Lead::new("Acme", "Berlin");
        assert!(lead.add_job(job("Nurse", ts(2024, 10, 5, 8, 0))));
        assert!(!lead.add_job(job("Nurse", ts(2024, 10, 5, 23, 59))));
        assert_eq!(lead.jobs.len(), 1);
    }

    #[test]
    fn same_title_different_day_is_appended() {
        let mut lead = Lead::new("Acme", "Berlin");
        assert!(lead.add_job(job("Nurse", ts(2024, 10, 5, 12, 0))));
        assert!(lead.add_job(job("Nurse", ts(2024, 10, 6, 12, 0))));
        assert_eq!(lead.jobs.len(), 2);
    }

    #[test]
    fn most_recent_job_is_the_last_appended() {
        let mut lead = Lead::new("Acme", "Berlin");
        lead.add_job(job("Nurse", ts(2024, 10, 5, 12, 0)));
        lead.add_job(job("Cook", ts(2024, 10, 5, 13, 0)));
        assert_eq!(lead.most_recent_job().unwrap().title, "Cook");
    }

    #[test]
    fn apply_profile_skips_equal_and_empty_values() {
        let mut lead = Lead::new("Acme", "Berlin");
        lead.ceo = "Jane Doe".to_string();
        lead.industry = "Healthcare".to_string();

        let profile = CompanyProfile {
            ceo: Some("Jane Doe".to_string()),
            size: Some(String::new()),
            industry: Some("Logistics".to_string()),
            founded: None,
            ..CompanyProfile::default()
        };

        let updated = lead.apply_profile(&profile);
        assert_eq!(updated, vec!["industry"]);
        assert_eq!(lead.ceo, "Jane Doe");
        assert_eq!(lead.size, "");
        assert_eq!(lead.industry, "Logistics");
    }

    #[test]
    fn apply_profile_fills_empty_fields() {
        let mut lead = Lead::new("Acme", "Berlin");
        let profile = CompanyProfile {
            ceo: Some("Jane Doe".to_string()),
            company_url: Some("https://acme.example".to_string()),
            ..CompanyProfile::default()
        };
        let updated = lead.apply_profile(&profile);
        assert_eq!(updated, vec!["ceo", "company_url"]);
    }

    #[test]
    fn progress_marks_each_term_at_most_once() {
        let mut progress = CrawlProgress::new("2024-10-05");
        progress.mark_complete("Nurse", 3);
        progress.mark_complete("Nurse", 9);
        assert_eq!(progress.completed.len(), 1);
        assert_eq!(progress.completed[0].leads_added, 3);
        assert!(progress.is_complete("Nurse"));
        assert!(!progress.is_complete("Cook"));
    }

    #[test]
    fn progress_date_key_is_calendar_day() {
        let now = ts(2024, 10, 5, 23, 59);
        assert_eq!(progress_date_key(now), "2024-10-05");
    }
}
