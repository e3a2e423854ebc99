use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::dispatch::{ApiClient, QueryParameters, RequestParams};
use crate::error::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChartRepository {
    pub name: String,
    pub url: String,
}

impl ChartRepository {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListReposResponse {
    repositories: Vec<ChartRepository>,
}

impl ApiClient {
    pub async fn add_repository(&self, repository: &ChartRepository) -> Result<(), ApiError> {
        let body = serde_json::to_value(repository).map_err(|error| {
            ApiError::new(500, format!("failed to encode repository: {error}"))
        })?;
        let params = RequestParams::with_json(Method::POST, body);
        self.request("/helm/repositories", &params, true, false, &QueryParameters::default())
            .await?;
        Ok(())
    }

    pub async fn list_repositories(&self) -> Result<Vec<ChartRepository>, ApiError> {
        let value = self
            .request(
                "/helm/repositories",
                &RequestParams::default(),
                true,
                false,
                &QueryParameters::default(),
            )
            .await?
            .into_json()?;
        let parsed: ListReposResponse = serde_json::from_value(value).map_err(|error| {
            ApiError::new(500, format!("unexpected repository list: {error}"))
        })?;
        Ok(parsed.repositories)
    }

    pub async fn update_repository(&self, repository: &ChartRepository) -> Result<(), ApiError> {
        let body = serde_json::to_value(repository).map_err(|error| {
            ApiError::new(500, format!("failed to encode repository: {error}"))
        })?;
        let params = RequestParams::with_json(Method::PUT, body);
        self.request("/helm/repositories", &params, true, false, &QueryParameters::default())
            .await?;
        Ok(())
    }

    pub async fn remove_repository(&self, name: &str) -> Result<(), ApiError> {
        let url = self.build_url(
            "/helm/repositories",
            false,
            &[("name".to_string(), name.to_string())],
        )?;
        let params = RequestParams::with_method(Method::DELETE);
        self.send(url, &params, true).await?;
        Ok(())
    }
}
