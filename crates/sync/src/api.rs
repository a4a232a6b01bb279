//! Backend job endpoints.
//!
//! [`JobApi`] is the seam the tracker, poller and registry talk through;
//! [`HttpJobApi`] is the reqwest implementation.

use async_trait::async_trait;
use pulseboard_types::{JobId, JobRecord};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

use crate::config::SyncConfig;
use crate::error::ApiError;

#[async_trait]
pub trait JobApi: Send + Sync {
    /// `GET /jobs/{id}`
    async fn job_status(&self, job_id: &JobId) -> Result<JobRecord, ApiError>;

    /// `POST /jobs/{id}/cancel`. The acknowledgement is not the final word:
    /// the terminal status still arrives through observation.
    async fn cancel_job(&self, job_id: &JobId) -> Result<JobRecord, ApiError>;

    /// `GET /jobs?limit=N`, newest first.
    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, ApiError>;
}

/// HTTP client for the job endpoints.
#[derive(Debug, Clone)]
pub struct HttpJobApi {
    client: Client,
    base: String,
}

impl HttpJobApi {
    pub fn new(config: &SyncConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base: config.api_base().to_string(),
        })
    }

    fn job_url(&self, job_id: &JobId, suffix: &str) -> String {
        format!(
            "{}/jobs/{}{}",
            self.base,
            urlencoding::encode(job_id.as_str()),
            suffix
        )
    }

    async fn fetch_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn job_status(&self, job_id: &JobId) -> Result<JobRecord, ApiError> {
        let request = self.client.get(self.job_url(job_id, ""));
        self.fetch_json(request).await
    }

    async fn cancel_job(&self, job_id: &JobId) -> Result<JobRecord, ApiError> {
        let request = self.client.post(self.job_url(job_id, "/cancel"));
        self.fetch_json(request).await
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, ApiError> {
        let request = self
            .client
            .get(format!("{}/jobs", self.base))
            .query(&[("limit", limit)]);
        self.fetch_json(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use pulseboard_types::{JobKind, JobStatus};
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_for(server: &MockServer) -> HttpJobApi {
        let config = SyncConfig {
            api_base: format!("{}/api/", server.uri()),
            ..SyncConfig::default()
        };
        HttpJobApi::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_job_status_decodes_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/jobs/imp-7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "job_id": "imp-7",
                "kind": "import",
                "status": "running",
                "progress": {"stage": "importing", "chunk": 2, "total_chunks": 8}
            })))
            .mount(&server)
            .await;

        let record = api_for(&server)
            .job_status(&JobId::from("imp-7"))
            .await
            .unwrap();
        assert_eq!(record.job_id, JobId::from("imp-7"));
        assert_eq!(record.kind, JobKind::Import);
        assert_eq!(record.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_job_status_maps_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/jobs/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such job"))
            .mount(&server)
            .await;

        let err = api_for(&server)
            .job_status(&JobId::from("missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("no such job"));
    }

    #[tokio::test]
    async fn test_job_status_rejects_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/jobs/bad"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"job_id\": 5"))
            .mount(&server)
            .await;

        let err = api_for(&server)
            .job_status(&JobId::from("bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[tokio::test]
    async fn test_cancel_job_posts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/jobs/imp-7/cancel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "job_id": "imp-7",
                "status": "running"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ack = api_for(&server)
            .cancel_job(&JobId::from("imp-7"))
            .await
            .unwrap();
        assert_eq!(ack.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_recent_jobs_passes_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/jobs"))
            .and(query_param("limit", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"job_id": "a", "status": "running"},
                {"job_id": "b", "status": "completed"}
            ])))
            .mount(&server)
            .await;

        let jobs = api_for(&server).recent_jobs(2).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].status, JobStatus::Completed);
    }

    #[test]
    fn test_job_url_encodes_id() {
        let config = SyncConfig {
            api_base: "http://host/api".to_string(),
            ..SyncConfig::default()
        };
        let api = HttpJobApi::new(&config).unwrap();
        assert_eq!(
            api.job_url(&JobId::from("a b/c"), "/cancel"),
            "http://host/api/jobs/a%20b%2Fc/cancel"
        );
    }
}
