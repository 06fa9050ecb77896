//! Push local leads into Close CRM as leads plus custom objects.

use std::sync::Arc;

use anyhow::Result;
use ilg_core::Lead;
use ilg_crm::{CrmClient, RemoteLead};
use ilg_store::LeadStore;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmMatch {
    pub company_name: String,
    pub remote_id: String,
    /// Whether the remote lead was created by this run rather than matched.
    pub created: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmSyncSummary {
    pub total_leads: usize,
    pub failed: usize,
    pub matches: Vec<CrmMatch>,
}

/// A lead is flagged synced only when at least one remote lead ended up
/// fully attached or freshly created; otherwise it stays eligible for a
/// future run.
fn should_mark_synced(matches: &[CrmMatch]) -> bool {
    !matches.is_empty()
}

pub struct CrmSyncer {
    client: CrmClient,
    leads: Arc<dyn LeadStore>,
}

impl CrmSyncer {
    pub fn new(client: CrmClient, leads: Arc<dyn LeadStore>) -> Self {
        Self { client, leads }
    }

    /// Sync every local lead. Per-lead failures are logged and skipped so one
    /// bad record never aborts the run.
    pub async fn run(&self) -> Result<CrmSyncSummary> {
        let leads = self.leads.all().await?;
        let mut summary = CrmSyncSummary {
            total_leads: leads.len(),
            ..CrmSyncSummary::default()
        };
        for (index, lead) in leads.iter().enumerate() {
            info!(
                company = %lead.company_name,
                position = index + 1,
                total = leads.len(),
                "syncing lead"
            );
            match self.sync_lead(lead).await {
                Ok(matches) => summary.matches.extend(matches),
                Err(err) => {
                    warn!(company = %lead.company_name, error = ?err, "lead sync failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn sync_lead(&self, lead: &Lead) -> Result<Vec<CrmMatch>> {
        let remote_leads = self.client.search_leads_by_company(&lead.company_name).await?;
        let mut matches = Vec::new();

        if remote_leads.is_empty() {
            info!(company = %lead.company_name, "no remote match, creating lead");
            let remote = self.client.create_lead(&lead.company_name).await?;
            self.client.create_company_info(&remote.id, lead).await?;
            for job in &lead.jobs {
                self.client.create_job_object(&remote.id, job).await?;
            }
            matches.push(CrmMatch {
                company_name: lead.company_name.clone(),
                remote_id: remote.id,
                created: true,
            });
        } else {
            info!(
                company = %lead.company_name,
                remote_count = remote_leads.len(),
                "matched remote leads"
            );
            for remote in &remote_leads {
                match self.attach_records(remote, lead).await {
                    Ok(()) => matches.push(CrmMatch {
                        company_name: lead.company_name.clone(),
                        remote_id: remote.id.clone(),
                        created: false,
                    }),
                    Err(err) => {
                        warn!(
                            company = %lead.company_name,
                            remote_id = %remote.id,
                            error = ?err,
                            "failed to attach records, continuing"
                        );
                    }
                }
            }
        }

        if should_mark_synced(&matches) {
            self.mark_synced(lead).await?;
        } else {
            warn!(company = %lead.company_name, "no remote records attached, leaving lead unsynced");
        }
        Ok(matches)
    }

    /// Ensure the company-info object and one job object per posting exist on
    /// the remote lead, creating whatever is missing.
    async fn attach_records(&self, remote: &RemoteLead, lead: &Lead) -> Result<()> {
        if self.client.company_info_exists(&remote.id).await? {
            info!(company = %lead.company_name, remote_id = %remote.id, "company info already attached");
        } else {
            self.client.create_company_info(&remote.id, lead).await?;
        }
        for job in &lead.jobs {
            if self.client.job_object_exists(&remote.id, &job.title).await? {
                continue;
            }
            self.client.create_job_object(&remote.id, job).await?;
        }
        Ok(())
    }

    async fn mark_synced(&self, lead: &Lead) -> Result<()> {
        let mut synced = lead.clone();
        synced.enriched = true;
        self.leads.save(&synced).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilg_crm::{CrmClient, CrmConfig};
    use ilg_store::{LeadStore, MemoryStore};

    fn crm_match(remote_id: &str) -> CrmMatch {
        CrmMatch {
            company_name: "Acme".to_string(),
            remote_id: remote_id.to_string(),
            created: false,
        }
    }

    /// A local address with nothing listening on it.
    fn dead_endpoint() -> CrmConfig {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        CrmConfig {
            api_key: "key".to_string(),
            base_url: format!("http://{addr}"),
        }
    }

    #[test]
    fn leads_without_attached_records_are_not_flagged() {
        assert!(!should_mark_synced(&[]));
        assert!(should_mark_synced(&[crm_match("lead_1")]));
    }

    #[tokio::test]
    async fn a_failed_sync_leaves_the_lead_eligible_for_retry() {
        let store = Arc::new(MemoryStore::new());
        LeadStore::save(store.as_ref(), &Lead::new("Acme", "Berlin"))
            .await
            .unwrap();

        let client = CrmClient::new(dead_endpoint()).unwrap();
        let syncer = CrmSyncer::new(client, store.clone());
        let summary = syncer.run().await.unwrap();

        assert_eq!(summary.failed, 1);
        assert!(summary.matches.is_empty());
        let lead = LeadStore::find_by_company(store.as_ref(), "Acme")
            .await
            .unwrap()
            .unwrap();
        assert!(!lead.enriched);
    }
}
