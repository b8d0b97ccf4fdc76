//! HTTP client for the ingestion service.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::ReportsBody;
use crate::Error;

const UPLOAD_DEADLINE: Duration = Duration::from_secs(30);

// Stamped on every backend request so a co-resident agent can recognize and
// filter its own traffic.
pub const HEADER_CLI_VERSION: &str = "X-Akita-CLI-Git-Version";
pub const HEADER_REQUEST_ID: &str = "X-Akita-Request-ID";

#[derive(Debug, Clone, Serialize)]
struct CreateLearnSession<'a> {
    name: &'a str,
    tags: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LearnSession {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

pub struct Client {
    http: reqwest::Client,
    base: url::Url,
    token: String,
    client_id: String,
}

impl Client {
    pub fn new(base: url::Url, token: String, client_id: String) -> Result<Client, Error> {
        let http = reqwest::Client::builder()
            .timeout(UPLOAD_DEADLINE)
            .build()?;
        Ok(Client {
            http,
            base,
            token,
            client_id,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder, Error> {
        let url = self.base.join(path)?;
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(&self.token)
            .header(HEADER_CLI_VERSION, env!("CARGO_PKG_VERSION"))
            .header(HEADER_REQUEST_ID, format!("{:x}", rand_request_id()))
            .header("X-Akita-Client-ID", &self.client_id))
    }

    /// Create a learn session by name, or resolve the existing one when the
    /// service answers 409.
    pub async fn resolve_learn_session(
        &self,
        service: &str,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<LearnSession, Error> {
        let path = format!("v1/services/{}/learn_sessions", service);
        let response = self
            .request(reqwest::Method::POST, &path)?
            .json(&CreateLearnSession { name, tags })
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            reqwest::StatusCode::CONFLICT => {
                tracing::debug!(session = name, "learn session exists; fetching by name");
                self.fetch_learn_session(service, name).await
            }
            status => Err(Error::Api {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn fetch_learn_session(&self, service: &str, name: &str) -> Result<LearnSession, Error> {
        let path = format!("v1/services/{}/learn_sessions/{}", service, name);
        let response = self.request(reqwest::Method::GET, &path)?.send().await?;
        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            status => Err(Error::Api {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Upload one batch. 429 is surfaced as Throttled; everything else
    /// non-success is an API error. The caller never retries a batch.
    pub async fn upload_reports(
        &self,
        service: &str,
        session_id: &str,
        body: &ReportsBody,
    ) -> Result<(), Error> {
        let path = format!("v1/services/{}/learn_sessions/{}/reports", service, session_id);
        let response = self
            .request(reqwest::Method::POST, &path)?
            .json(body)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            reqwest::StatusCode::TOO_MANY_REQUESTS => Err(Error::Throttled),
            status => Err(Error::Api {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

/// Request ids only need to be distinct enough for log correlation.
fn rand_request_id() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    nanos ^ (std::process::id() as u128) << 64
}
