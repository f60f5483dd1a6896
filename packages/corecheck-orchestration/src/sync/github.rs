//! GitHub organisation repository source

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corecheck_storage::RepositoryRecord;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{RepositoryRef, RepositorySource};
use crate::error::{OrchestratorError, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.github.com";
const PER_PAGE: usize = 100;
const BODY_EXCERPT: usize = 512;

#[derive(Debug, Deserialize)]
struct GithubRepository {
    id: u64,
    full_name: String,
    default_branch: Option<String>,
    html_url: Option<String>,
    description: Option<String>,
    #[serde(default)]
    archived: bool,
    pushed_at: Option<DateTime<Utc>>,
}

impl GithubRepository {
    fn into_record(self) -> RepositoryRecord {
        let mut record = RepositoryRecord::new(
            self.id.to_string(),
            self.full_name,
            self.default_branch.unwrap_or_else(|| "main".to_string()),
        );
        record.html_url = self.html_url;
        record.description = self.description;
        record.archived = self.archived;
        record.pushed_at = self.pushed_at;
        record
    }
}

pub struct GithubSource {
    client: Client,
    base_url: String,
    org: String,
    token: String,
}

impl GithubSource {
    /// `timeout` bounds each request
    pub fn new(
        base_url: Option<&str>,
        org: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("corecheck/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(OrchestratorError::config)?;
        Ok(Self {
            client,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            org: org.into(),
            token: token.into(),
        })
    }

    fn get(&self, url: &str) -> RequestBuilder {
        self.client
            .get(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, url: &str) -> Result<T> {
        let response = request.send().await.map_err(|e| {
            OrchestratorError::UpstreamUnavailable(format!("request to {} failed: {}", url, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, url, &body));
        }

        response.json::<T>().await.map_err(|e| {
            OrchestratorError::UpstreamRejected(format!("unexpected payload from {}: {}", url, e))
        })
    }
}

/// 429 and 5xx are worth retrying; any other status is a refusal
fn classify(status: StatusCode, url: &str, body: &str) -> OrchestratorError {
    let excerpt: String = body.chars().take(BODY_EXCERPT).collect();
    let message = format!("{} from {}: {}", status, url, excerpt);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        OrchestratorError::UpstreamUnavailable(message)
    } else {
        OrchestratorError::UpstreamRejected(message)
    }
}

#[async_trait]
impl RepositorySource for GithubSource {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn list_repositories(&self) -> Result<Vec<RepositoryRef>> {
        let url = format!("{}/orgs/{}/repos", self.base_url, self.org);
        let mut repositories = Vec::new();
        let mut page = 1usize;

        loop {
            let request = self.get(&url).query(&[
                ("per_page", PER_PAGE.to_string()),
                ("page", page.to_string()),
                ("type", "all".to_string()),
            ]);
            let batch: Vec<GithubRepository> = self.send(request, &url).await?;
            debug!("Page {} of {} returned {} repositories", page, self.org, batch.len());

            let last = batch.len() < PER_PAGE;
            repositories.extend(batch.into_iter().map(|r| RepositoryRef {
                external_id: r.id.to_string(),
                full_name: r.full_name,
            }));
            if last {
                break;
            }
            page += 1;
        }
        Ok(repositories)
    }

    async fn fetch_repository(&self, repository: &RepositoryRef) -> Result<RepositoryRecord> {
        let url = format!("{}/repos/{}", self.base_url, repository.full_name);
        let fetched: GithubRepository = self.send(self.get(&url), &url).await?;
        if fetched.id.to_string() != repository.external_id {
            return Err(OrchestratorError::UpstreamRejected(format!(
                "{} now resolves to repository {}, expected {}",
                repository.full_name, fetched.id, repository.external_id
            )));
        }
        Ok(fetched.into_record())
    }
}
