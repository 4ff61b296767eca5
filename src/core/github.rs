//! GitHub commit status client.

use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::ci_gate::{CommitState, CommitStatus, StatusSource};
use crate::config::GithubConfig;
use crate::error::{Error, Result};

const USER_AGENT: &str = concat!("hooks/", env!("CARGO_PKG_VERSION"));
const SERVICE: &str = "GitHub";

#[derive(Deserialize)]
struct CombinedStatus {
    #[serde(default)]
    statuses: Vec<CommitStatus>,
}

pub struct GithubStatusClient {
    client: Client,
    api_url: String,
    token: Option<String>,
    context: String,
}

impl GithubStatusClient {
    pub fn new(config: &GithubConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::internal_io(e.to_string(), Some("create HTTP client".to_string())))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone().filter(|t| !t.is_empty()),
            context: config.context.clone(),
        })
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    fn authorize(&self, request: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("token {}", token)),
            None => request,
        }
    }
}

fn http_error(e: reqwest::Error) -> Error {
    Error::external_service(SERVICE, e.to_string(), e.status().map(|s| s.as_u16()))
}

fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(Error::external_service(
        SERVICE,
        format!("HTTP {}: {}", status.as_u16(), body.trim()),
        Some(status.as_u16()),
    ))
}

impl StatusSource for GithubStatusClient {
    fn statuses(&self, repository: &str, sha: &str) -> Result<Vec<CommitStatus>> {
        let url = format!("{}/repos/{}/commits/{}/status", self.api_url, repository, sha);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .map_err(http_error)?;

        let combined: CombinedStatus = check_status(response)?.json().map_err(|e| {
            Error::internal_json(e.to_string(), Some("parse GitHub status response".to_string()))
        })?;
        Ok(combined.statuses)
    }

    fn report(
        &self,
        repository: &str,
        sha: &str,
        state: CommitState,
        target_url: Option<&str>,
        description: Option<&str>,
    ) -> Result<()> {
        let url = format!("{}/repos/{}/statuses/{}", self.api_url, repository, sha);
        let body = json!({
            "state": state.as_str(),
            "target_url": target_url,
            "description": description,
            "context": self.context,
        });

        let response = self
            .authorize(self.client.post(&url).json(&body))
            .send()
            .map_err(http_error)?;
        check_status(response)?;
        Ok(())
    }
}
