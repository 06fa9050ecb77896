//! Close CRM client: lead search, lead creation, and custom-object writes.

use std::time::Duration;

use ilg_core::{Job, Lead};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "ilg-crm";

pub const DEFAULT_BASE_URL: &str = "https://api.close.com/api/v1";

/// Custom-object type holding scraped company facts.
pub const COMPANY_INFO_TYPE_ID: &str = "cotype_2cAvvDHnmJixdWCbAQPLb4";
/// Custom-object type holding one job posting each.
pub const JOB_OBJECT_TYPE_ID: &str = "cotype_3U378D4nJe2a0PFet0URnl";
/// Status assigned to leads this pipeline creates.
pub const NEW_LEAD_STATUS_ID: &str = "stat_7vZfSb4h7VVbKy8FAufWmGO9iZQ1jftadoJi5xZJMwf";

const CF_COMPANY_CEO: &str = "custom.cf_CrPdriLTU54qg6T8MNIjRgZHCGYeiLkbJ7pYc2MEpqu";
const CF_COMPANY_SIZE: &str = "custom.cf_IVvAAb3pIDlwAMwnpOthpLp6j4US4x8Za7JvFDNQftU";
const CF_COMPANY_WEBSITE: &str = "custom.cf_qnHDPAbt1lo2YJ1ENnPZgGqQspmzaIfFzr7IsxOXfwb";
const CF_COMPANY_PROFILE_URL: &str = "custom.cf_lPNqFoTgLiTTQAbaEfAXCyOl7GqM3zzh2dVwCenKzNp";
const CF_COMPANY_INDUSTRY: &str = "custom.cf_jj9iNm9Q24DQrSQdfFxId0dBGlm6chaejtLaNx0N9BC";
const CF_COMPANY_LOCATION: &str = "custom.cf_Xy7YFq4YExjfKFnvTAeEW5PGr9pVKEdhvdaUdgObcEA";
const CF_COMPANY_SALES_VOLUME: &str = "custom.cf_uCFQsLmnfmUPWns5dXnRr1mj9Eb0DdunDk9E4F0j8gM";
const CF_JOB_LINK: &str = "custom.cf_0Bm7d4zZlIHgyKjYsP6Rpa3fqYqxA3STc3wpMx2H945";
const CF_JOB_DATE: &str = "custom.cf_mNkGlS4prH5DVmJ5Q6251ZcSqW0JwVu1crYPFb8WjL9";

/// Pause after every remote call so sync traffic stays well under rate limits.
const PACING: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub api_key: String,
    pub base_url: String,
}

impl CrmConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// The remote lead as returned by search and create calls.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteLead {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomObject {
    pub custom_object_type_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: Vec<T>,
}

/// The exact-match query document for a display-name search.
pub fn search_query(company_name: &str) -> serde_json::Value {
    json!({
        "query": {
            "type": "and",
            "queries": [
                { "type": "object_type", "object_type": "lead" },
                {
                    "type": "field_condition",
                    "field": {
                        "type": "regular_field",
                        "object_type": "lead",
                        "field_name": "display_name"
                    },
                    "condition": {
                        "type": "text",
                        "mode": "exact_value",
                        "value": company_name
                    }
                }
            ]
        }
    })
}

pub fn has_company_info(objects: &[CustomObject]) -> bool {
    objects
        .iter()
        .any(|o| o.custom_object_type_id == COMPANY_INFO_TYPE_ID)
}

/// Job objects are matched by title alone; the stored date is not compared.
pub fn has_job_object(objects: &[CustomObject], title: &str) -> bool {
    objects
        .iter()
        .any(|o| o.custom_object_type_id == JOB_OBJECT_TYPE_ID && o.name == title)
}

#[derive(Debug)]
pub struct CrmClient {
    client: reqwest::Client,
    config: CrmConfig,
}

impl CrmClient {
    pub fn new(config: CrmConfig) -> Result<Self, CrmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, config })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, CrmError> {
        let response = self
            .client
            .get(format!("{}{}", self.config.base_url, path))
            .basic_auth(&self.config.api_key, Some(""))
            .send()
            .await?;
        let parsed = Self::read_json(response).await;
        tokio::time::sleep(PACING).await;
        parsed
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, CrmError> {
        let response = self
            .client
            .post(format!("{}{}", self.config.base_url, path))
            .basic_auth(&self.config.api_key, Some(""))
            .json(body)
            .send()
            .await?;
        let parsed = Self::read_json(response).await;
        tokio::time::sleep(PACING).await;
        parsed
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CrmError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    /// Remote leads whose display name exactly matches the company name.
    pub async fn search_leads_by_company(
        &self,
        company_name: &str,
    ) -> Result<Vec<RemoteLead>, CrmError> {
        let envelope: DataEnvelope<RemoteLead> = self
            .post_json("/data/search/", &search_query(company_name))
            .await?;
        debug!(company = %company_name, matches = envelope.data.len(), "lead search done");
        Ok(envelope.data)
    }

    pub async fn create_lead(&self, company_name: &str) -> Result<RemoteLead, CrmError> {
        debug!(company = %company_name, "creating remote lead");
        self.post_json(
            "/lead/",
            &json!({
                "name": company_name,
                "status_id": NEW_LEAD_STATUS_ID,
            }),
        )
        .await
    }

    pub async fn list_custom_objects(&self, lead_id: &str) -> Result<Vec<CustomObject>, CrmError> {
        let envelope: DataEnvelope<CustomObject> = self
            .get_json(&format!("/custom_object/?lead_id={lead_id}"))
            .await?;
        Ok(envelope.data)
    }

    pub async fn company_info_exists(&self, lead_id: &str) -> Result<bool, CrmError> {
        Ok(has_company_info(&self.list_custom_objects(lead_id).await?))
    }

    pub async fn job_object_exists(&self, lead_id: &str, title: &str) -> Result<bool, CrmError> {
        Ok(has_job_object(&self.list_custom_objects(lead_id).await?, title))
    }

    /// Attach one company-info object carrying the scraped facts.
    pub async fn create_company_info(&self, lead_id: &str, lead: &Lead) -> Result<(), CrmError> {
        let body = json!({
            "custom_object_type_id": COMPANY_INFO_TYPE_ID,
            "lead_id": lead_id,
            "name": lead.company_name,
            (CF_COMPANY_CEO): lead.ceo,
            (CF_COMPANY_SIZE): lead.size,
            (CF_COMPANY_WEBSITE): lead.company_url,
            (CF_COMPANY_PROFILE_URL): lead.profile_url,
            (CF_COMPANY_INDUSTRY): lead.industry,
            (CF_COMPANY_LOCATION): lead.location,
            (CF_COMPANY_SALES_VOLUME): lead.sales_volume,
        });
        let _: serde_json::Value = self.post_json("/custom_object/", &body).await?;
        Ok(())
    }

    /// Attach one job object for a posting.
    pub async fn create_job_object(&self, lead_id: &str, job: &Job) -> Result<(), CrmError> {
        let body = json!({
            "custom_object_type_id": JOB_OBJECT_TYPE_ID,
            "lead_id": lead_id,
            "name": job.title,
            (CF_JOB_LINK): job.link,
            (CF_JOB_DATE): job.posted_at.to_rfc3339(),
        });
        let _: serde_json::Value = self.post_json("/custom_object/", &body).await?;
        Ok(())
    }
}
