//! HTTP client for the daemon control API.

use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use agentforge_core::Decision;
use agentforge_core::model::{
    AgentInfo, BlockedFeature, ControlResponse, Feature, FeatureId, FeatureStats, GraphView,
    NewFeature, NewFeatureSpec, NewSchedule, RunSettings, RunStatus, Schedule, ScheduleUpdate,
};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Cannot reach daemon at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{message} ({status})")]
    Api {
        status: u16,
        message: String,
        kind: Option<String>,
    },
}

#[derive(Debug, serde::Deserialize)]
struct ApiErrorBody {
    error: String,
    kind: Option<String>,
}

/// `GET /status` body.
#[derive(Debug, serde::Deserialize)]
pub struct StatusResponse {
    pub run: RunStatus,
    pub features: FeatureStats,
}

/// `GET /schedules/next` body.
#[derive(Debug, serde::Deserialize)]
pub struct NextRun {
    pub has_schedules: bool,
    pub next_start: Option<chrono::DateTime<chrono::Utc>>,
    pub next_end: Option<chrono::DateTime<chrono::Utc>>,
    pub is_currently_running: bool,
    pub active_schedule_count: usize,
}

#[derive(Debug)]
pub struct DaemonClient {
    http: reqwest::Client,
    base_url: String,
}

impl DaemonClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        // reqwest is built with rustls-no-provider; Err means already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&(impl Serialize + Sync)>,
    ) -> Result<reqwest::Response, ClientError> {
        let url = self.url(path);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request.send().await.map_err(|source| {
            if source.is_connect() {
                ClientError::Connect {
                    url: self.base_url.clone(),
                    source,
                }
            } else {
                ClientError::Http(source)
            }
        })?;
        Self::check_status(resp).await
    }

    /// Turn a non-success response into [`ClientError::Api`].
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        let (message, kind) = match serde_json::from_str::<ApiErrorBody>(&text) {
            Ok(body) => (body.error, body.kind),
            Err(_) if text.is_empty() => (
                status.canonical_reason().unwrap_or("Unknown").to_string(),
                None,
            ),
            Err(_) => (text, None),
        };
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
            kind,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        Ok(self.send(Method::GET, path, None::<&()>).await?.json().await?)
    }

    async fn call<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ClientError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        Ok(self.send(method, path, body).await?.json().await?)
    }

    /// Run controls answer 409 with a [`ControlResponse`] body on refusal.
    async fn control(
        &self,
        path: &str,
        body: Option<&(impl Serialize + Sync)>,
    ) -> Result<ControlResponse, ClientError> {
        let mut request = self.http.post(self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request.send().await.map_err(|source| ClientError::Connect {
            url: self.base_url.clone(),
            source,
        })?;
        if resp.status() == StatusCode::CONFLICT {
            return Ok(resp.json().await?);
        }
        Ok(Self::check_status(resp).await?.json().await?)
    }

    // =========================================================================
    // Run control
    // =========================================================================

    pub async fn health(&self) -> Result<serde_json::Value, ClientError> {
        self.get("/health").await
    }

    pub async fn status(&self) -> Result<StatusResponse, ClientError> {
        self.get("/status").await
    }

    pub async fn agents(&self) -> Result<Vec<AgentInfo>, ClientError> {
        self.get("/agents").await
    }

    pub async fn start(&self, settings: &RunSettings) -> Result<ControlResponse, ClientError> {
        self.control("/run/start", Some(settings)).await
    }

    pub async fn stop(&self, reason: Option<&str>) -> Result<ControlResponse, ClientError> {
        self.control("/run/stop", Some(&serde_json::json!({ "reason": reason })))
            .await
    }

    pub async fn pause(&self) -> Result<ControlResponse, ClientError> {
        self.control("/run/pause", None::<&()>).await
    }

    pub async fn resume(&self) -> Result<ControlResponse, ClientError> {
        self.control("/run/resume", None::<&()>).await
    }

    /// Open the event stream.
    pub async fn events(&self) -> Result<reqwest::Response, ClientError> {
        self.send(Method::GET, "/events", None::<&()>).await
    }

    pub async fn evaluate(&self, command: &str) -> Result<Decision, ClientError> {
        self.call(
            Method::POST,
            "/policy/evaluate",
            Some(&serde_json::json!({ "command": command })),
        )
        .await
    }

    // =========================================================================
    // Features
    // =========================================================================

    pub async fn features(&self) -> Result<Vec<Feature>, ClientError> {
        self.get("/features").await
    }

    pub async fn ready(&self) -> Result<Vec<Feature>, ClientError> {
        self.get("/features/ready").await
    }

    pub async fn blocked(&self) -> Result<Vec<BlockedFeature>, ClientError> {
        self.get("/features/blocked").await
    }

    pub async fn stats(&self) -> Result<FeatureStats, ClientError> {
        self.get("/features/stats").await
    }

    pub async fn graph(&self) -> Result<GraphView, ClientError> {
        self.get("/features/graph").await
    }

    pub async fn feature(&self, id: FeatureId) -> Result<Feature, ClientError> {
        self.get(&format!("/features/{id}")).await
    }

    pub async fn add_feature(&self, new: &NewFeature) -> Result<Feature, ClientError> {
        self.call(Method::POST, "/features", Some(new)).await
    }

    pub async fn add_features(&self, specs: &[NewFeatureSpec]) -> Result<Vec<Feature>, ClientError> {
        self.call(Method::POST, "/features/bulk", Some(&specs)).await
    }

    pub async fn remove_feature(&self, id: FeatureId) -> Result<Feature, ClientError> {
        self.call(Method::DELETE, &format!("/features/{id}"), None::<&()>)
            .await
    }

    pub async fn skip_feature(&self, id: FeatureId) -> Result<Feature, ClientError> {
        self.call(Method::POST, &format!("/features/{id}/skip"), None::<&()>)
            .await
    }

    pub async fn retry_feature(&self, id: FeatureId) -> Result<Feature, ClientError> {
        self.call(Method::POST, &format!("/features/{id}/retry"), None::<&()>)
            .await
    }

    pub async fn set_dependencies(
        &self,
        id: FeatureId,
        dependencies: &[FeatureId],
    ) -> Result<Feature, ClientError> {
        self.call(
            Method::PUT,
            &format!("/features/{id}/dependencies"),
            Some(&serde_json::json!({ "dependencies": dependencies })),
        )
        .await
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    pub async fn schedules(&self) -> Result<Vec<Schedule>, ClientError> {
        self.get("/schedules").await
    }

    pub async fn add_schedule(&self, new: &NewSchedule) -> Result<Schedule, ClientError> {
        self.call(Method::POST, "/schedules", Some(new)).await
    }

    pub async fn update_schedule(
        &self,
        id: i64,
        update: &ScheduleUpdate,
    ) -> Result<Schedule, ClientError> {
        self.call(Method::PATCH, &format!("/schedules/{id}"), Some(update))
            .await
    }

    pub async fn remove_schedule(&self, id: i64) -> Result<(), ClientError> {
        self.send(Method::DELETE, &format!("/schedules/{id}"), None::<&()>)
            .await?;
        Ok(())
    }

    pub async fn skip_schedule(&self, id: i64) -> Result<Schedule, ClientError> {
        self.call(Method::POST, &format!("/schedules/{id}/skip"), None::<&()>)
            .await
    }

    pub async fn next_run(&self) -> Result<NextRun, ClientError> {
        self.get("/schedules/next").await
    }
}
