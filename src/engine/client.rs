//! HTTP client for the structuring engine.
//!
//! Thin reqwest wrapper over the engine's REST surface. No retry logic here:
//! the tracker owns the transient-failure policy, so a transport error is
//! surfaced as-is.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::models::{
    CalculationRequest, Config, GeneralSettings, OptimizationOutcome, OptimizationSettings,
    StructureResult,
};

use super::{JobHandle, ProgressReport, StructuringEngine};

#[derive(Serialize)]
struct SubmitBody<'a> {
    optimization_settings: &'a OptimizationSettings,
    general_settings: &'a GeneralSettings,
}

pub struct EngineClient {
    client: Client,
    base_url: String,
}

impl EngineClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent("StructurerClient/1.0")
            .build()
            .context("Failed to build engine HTTP client")?;

        Ok(Self {
            client,
            base_url: config.engine_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Engine path segment for a requested optimization method.
    /// Anything that is not genetic runs through the classic search.
    fn method_path(settings: &OptimizationSettings) -> &'static str {
        match settings.optimization_method.as_str() {
            "genetic" => "genetic",
            _ => "classic",
        }
    }

    async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("detail").and_then(Value::as_str).map(String::from))
                .unwrap_or(body);
            bail!("Engine {} failed with status {}: {}", what, status, detail);
        }
        Ok(response)
    }
}

#[async_trait]
impl StructuringEngine for EngineClient {
    async fn submit_job(
        &self,
        settings: &OptimizationSettings,
        general: &GeneralSettings,
    ) -> Result<JobHandle> {
        let url = format!(
            "{}/optimize/{}/submit/",
            self.base_url,
            Self::method_path(settings)
        );

        let response = self
            .client
            .post(&url)
            .json(&SubmitBody {
                optimization_settings: settings,
                general_settings: general,
            })
            .send()
            .await
            .context("Engine submit request failed")?;

        let handle: JobHandle = Self::check_status(response, "submit")
            .await?
            .json()
            .await
            .context("Failed to parse submit response")?;

        debug!("Submitted optimization job {}", handle.job_id);
        Ok(handle)
    }

    async fn query_progress(&self, job: &JobHandle) -> Result<ProgressReport> {
        let url = format!("{}/optimize/progress/{}", self.base_url, job.job_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Engine progress request failed")?;

        let mut report: ProgressReport = Self::check_status(response, "progress query")
            .await?
            .json()
            .await
            .context("Failed to parse progress response")?;

        // The engine reports failures through the phase label.
        if report.phase == "Error" {
            report.error = true;
        }

        Ok(report)
    }

    async fn fetch_result(&self, job: &JobHandle) -> Result<OptimizationOutcome> {
        let url = format!("{}/optimize/result/{}", self.base_url, job.job_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Engine result request failed")?;

        Self::check_status(response, "result fetch")
            .await?
            .json()
            .await
            .context("Failed to parse optimization result")
    }

    async fn calculate(&self, request: &CalculationRequest) -> Result<StructureResult> {
        let url = format!("{}/calculate/", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .context("Engine calculate request failed")?;

        Self::check_status(response, "calculate")
            .await?
            .json()
            .await
            .context("Failed to parse calculation result")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_path_selection() {
        let mut settings = OptimizationSettings::default();
        assert_eq!(EngineClient::method_path(&settings), "classic");

        settings.optimization_method = "genetic".to_string();
        assert_eq!(EngineClient::method_path(&settings), "genetic");

        settings.optimization_method = "something_else".to_string();
        assert_eq!(EngineClient::method_path(&settings), "classic");
    }
}
