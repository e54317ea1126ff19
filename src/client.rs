//! HTTP client for the registry REST API, used by chat peers.

use std::collections::BTreeMap;

use reqwest::{Client, StatusCode};
use thiserror::Error;

use crate::api::types::StatusResponse;
use crate::types::{Address, UserInfo};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Registry error ({status}): {message}")]
    Registry { status: u16, message: String },

    #[error("User already registered: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

#[derive(Clone, Debug)]
pub struct RegistryClient {
    client: Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn health(&self) -> Result<StatusResponse, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;

        if response.status() == StatusCode::OK {
            Ok(response.json().await?)
        } else {
            Err(self.error_from_response(response).await)
        }
    }

    pub async fn register(&self, name: &str, address: Address) -> Result<(), ClientError> {
        let url = format!("{}/users", self.base_url);
        let user = UserInfo {
            name: name.to_string(),
            address,
        };
        let response = self.client.post(&url).json(&user).send().await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::CONFLICT => Err(ClientError::Conflict(name.to_string())),
            _ => Err(self.error_from_response(response).await),
        }
    }

    pub async fn update(&self, name: &str, address: Address) -> Result<(), ClientError> {
        let url = format!("{}/users/{}", self.base_url, name);
        let response = self.client.put(&url).json(&address).send().await?;

        if response.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(self.error_from_response(response).await)
        }
    }

    pub async fn unregister(&self, name: &str) -> Result<(), ClientError> {
        let url = format!("{}/users/{}", self.base_url, name);
        let response = self.client.delete(&url).send().await?;

        if response.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(self.error_from_response(response).await)
        }
    }

    pub async fn list(&self) -> Result<BTreeMap<String, Address>, ClientError> {
        let url = format!("{}/users", self.base_url);
        let response = self.client.get(&url).send().await?;

        if response.status() == StatusCode::OK {
            Ok(response.json().await?)
        } else {
            Err(self.error_from_response(response).await)
        }
    }

    pub async fn lookup(&self, name: &str) -> Result<Address, ClientError> {
        let url = format!("{}/users/{}", self.base_url, name);
        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(name.to_string())),
            _ => Err(self.error_from_response(response).await),
        }
    }

    async fn error_from_response(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        ClientError::Registry { status, message }
    }
}
