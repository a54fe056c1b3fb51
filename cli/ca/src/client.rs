//! HTTP client for the control-plane API.

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::CliError;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";

/// API client for communicating with the control plane.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        let response = self.client.get(self.url(path)).send().await?;
        self.handle_response(response).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CliError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        self.handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, CliError> {
        if response.status().is_success() {
            response
                .json()
                .await
                .map_err(|e| CliError::Other(anyhow::anyhow!("Failed to parse response: {}", e)))
        } else {
            self.handle_error(response).await
        }
    }

    async fn handle_error<T>(&self, response: reqwest::Response) -> Result<T, CliError> {
        let status = response.status().as_u16();
        let problem: Problem = response.json().await.unwrap_or_else(|_| Problem {
            code: "unknown".to_string(),
            detail: "Unknown error".to_string(),
        });
        Err(CliError::api(status, problem.code, problem.detail))
    }
}

/// The control plane's problem-details body, reduced to what the CLI shows.
#[derive(Debug, Deserialize)]
struct Problem {
    code: String,
    detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let client = ApiClient::new("http://localhost:8080/").unwrap();
        assert_eq!(client.url("/v1/tasks"), "http://localhost:8080/v1/tasks");
    }

    #[tokio::test]
    async fn test_unreachable_api_is_network_error() {
        let client = ApiClient::new("http://127.0.0.1:9").unwrap();
        let err = client.get::<serde_json::Value>("/healthz").await.unwrap_err();
        assert!(matches!(err, CliError::Network(_)));
    }
}
