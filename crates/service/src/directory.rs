use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use officina_core::config::DirectoryConfig;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("directory responded with status {0}")]
    Status(reqwest::StatusCode),
}

/// Workshop directory collaborator. The only call this core makes is the
/// aggregate booking counter bump, and that call is fire-and-forget:
/// failures are logged by the caller, never propagated.
#[async_trait]
pub trait WorkshopDirectory: Send + Sync {
    async fn increment_booking_count(&self, workshop_id: &str) -> Result<(), DirectoryError>;
}

/// Used when the directory integration is disabled (tests, local runs).
pub struct NoopDirectory;

#[async_trait]
impl WorkshopDirectory for NoopDirectory {
    async fn increment_booking_count(&self, _workshop_id: &str) -> Result<(), DirectoryError> {
        Ok(())
    }
}

pub struct HttpWorkshopDirectory {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<SecretString>,
}

impl HttpWorkshopDirectory {
    pub fn new(
        base_url: impl Into<String>,
        api_token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url: base_url.into(), api_token })
    }

    pub fn from_config(config: &DirectoryConfig) -> Result<Arc<dyn WorkshopDirectory>, DirectoryError> {
        match (&config.enabled, &config.base_url) {
            (true, Some(base_url)) => Ok(Arc::new(Self::new(
                base_url.clone(),
                config.api_token.clone(),
                Duration::from_secs(config.timeout_secs),
            )?)),
            _ => Ok(Arc::new(NoopDirectory)),
        }
    }
}

#[async_trait]
impl WorkshopDirectory for HttpWorkshopDirectory {
    async fn increment_booking_count(&self, workshop_id: &str) -> Result<(), DirectoryError> {
        let url = format!(
            "{}/workshops/{}/bookings/increment",
            self.base_url.trim_end_matches('/'),
            workshop_id
        );

        let mut request = self.client.post(url);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use officina_core::config::DirectoryConfig;

    use super::{HttpWorkshopDirectory, NoopDirectory, WorkshopDirectory};

    #[tokio::test]
    async fn noop_directory_always_succeeds() {
        NoopDirectory.increment_booking_count("w-1").await.expect("noop must not fail");
    }

    #[test]
    fn disabled_config_builds_the_noop_backend() {
        let config = DirectoryConfig {
            enabled: false,
            base_url: Some("https://directory.example.com".to_string()),
            api_token: None,
            timeout_secs: 10,
        };

        // Only checks construction; the noop backend has no observable state
        // beyond its always-Ok behaviour covered above.
        HttpWorkshopDirectory::from_config(&config).expect("construct directory");
    }
}
