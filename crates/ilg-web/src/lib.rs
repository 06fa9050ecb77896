//! Thin JSON API over the lead store and the pipeline operations.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use ilg_crm::{CrmClient, CrmConfig};
use ilg_pipeline::{Crawler, CrmSyncer, Enricher, PipelineConfig};
use ilg_store::{LeadStore, ProgressStore};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "ilg-web";

#[derive(Clone)]
pub struct AppState {
    pub config: PipelineConfig,
    pub leads: Arc<dyn LeadStore>,
    pub progress: Arc<dyn ProgressStore>,
}

impl AppState {
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
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/leads",
            get(list_leads).post(crawl_leads).delete(delete_leads),
        )
        .route("/api/leads/update/indeed", put(enrich_leads))
        .route("/api/leads/filter", post(sync_leads))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port = state.config.port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn list_leads(State(state): State<Arc<AppState>>) -> Response {
    match state.leads.all().await {
        Ok(leads) => (
            StatusCode::OK,
            Json(json!({ "totalLeads": leads.len(), "leads": leads })),
        )
            .into_response(),
        Err(err) => server_error("Failed to fetch leads", err.into()),
    }
}

async fn crawl_leads(State(state): State<Arc<AppState>>) -> Response {
    let crawler = Crawler::new(
        state.config.clone(),
        state.leads.clone(),
        state.progress.clone(),
    );
    match crawler.run().await {
        Ok(summary) => (
            StatusCode::OK,
            Json(json!({
                "message": "Job leads successfully scraped and saved.",
                "summary": summary,
            })),
        )
            .into_response(),
        Err(err) => server_error("Failed to scrape all search terms after retries", err),
    }
}

async fn enrich_leads(State(state): State<Arc<AppState>>) -> Response {
    let enricher = Enricher::new(state.config.clone(), state.leads.clone());
    match enricher.run().await {
        Ok(summary) => (
            StatusCode::OK,
            Json(json!({
                "message": "Profile URLs and company info successfully updated for leads.",
                "totalTime": format!("{:.2}", summary.elapsed_secs),
                "summary": summary,
            })),
        )
            .into_response(),
        Err(err) => server_error("Failed to update profile URLs and company info", err),
    }
}

async fn delete_leads(State(state): State<Arc<AppState>>) -> Response {
    match state.leads.delete_all().await {
        Ok(deleted) => (
            StatusCode::OK,
            Json(json!({
                "message": "All leads successfully deleted.",
                "deletedCount": deleted,
            })),
        )
            .into_response(),
        Err(err) => server_error("Failed to delete all leads", err.into()),
    }
}

async fn sync_leads(State(state): State<Arc<AppState>>) -> Response {
    let Some(api_key) = state.config.close_api_key.clone() else {
        return server_error(
            "Failed to sync leads",
            anyhow::anyhow!("CLOSE_API_KEY is not configured"),
        );
    };
    let client = match CrmClient::new(CrmConfig::new(api_key)) {
        Ok(client) => client,
        Err(err) => return server_error("Failed to sync leads", err.into()),
    };
    let syncer = CrmSyncer::new(client, state.leads.clone());
    match syncer.run().await {
        Ok(summary) => (
            StatusCode::OK,
            Json(json!({
                "totalMatches": summary.matches.len(),
                "matchedResults": summary.matches,
            })),
        )
            .into_response(),
        Err(err) => server_error("Failed to sync leads", err),
    }
}

fn server_error(message: &str, err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "message": message, "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use ilg_core::{Job, Lead};
    use ilg_store::MemoryStore;
    use tower::ServiceExt;

    fn test_state(store: Arc<MemoryStore>) -> AppState {
        AppState::new(PipelineConfig::default(), store.clone(), store)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn list_leads_reports_totals_and_documents() {
        let store = Arc::new(MemoryStore::new());
        let mut lead = Lead::new("Acme Pflege GmbH", "Berlin");
        lead.add_job(Job {
            title: "Pflegefachkraft".to_string(),
            link: "https://de.indeed.com/viewjob?jk=abc".to_string(),
            posted_at: Utc::now(),
        });
        LeadStore::save(store.as_ref(), &lead).await.unwrap();

        let app = app(test_state(store));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/leads")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["totalLeads"], 1);
        assert_eq!(json["leads"][0]["companyName"], "Acme Pflege GmbH");
        assert_eq!(json["leads"][0]["jobs"][0]["title"], "Pflegefachkraft");
    }

    #[tokio::test]
    async fn list_leads_on_an_empty_store() {
        let app = app(test_state(Arc::new(MemoryStore::new())));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/leads")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["totalLeads"], 0);
    }

    #[tokio::test]
    async fn delete_leads_reports_the_purged_count() {
        let store = Arc::new(MemoryStore::new());
        LeadStore::save(store.as_ref(), &Lead::new("Acme", "Berlin"))
            .await
            .unwrap();
        LeadStore::save(store.as_ref(), &Lead::new("NewCo", "Hamburg"))
            .await
            .unwrap();

        let app = app(test_state(store.clone()));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/api/leads")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["deletedCount"], 2);
        assert!(LeadStore::all(store.as_ref()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn crm_sync_without_an_api_key_is_a_server_error() {
        let app = app(test_state(Arc::new(MemoryStore::new())));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/leads/filter")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp).await;
        assert_eq!(json["message"], "Failed to sync leads");
    }
}
