use std::time::Duration;

use serde::{Deserialize, Serialize};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Desired configuration for one backend path: the stream is published by
/// the init command, which the backend restarts if it exits.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathConfig {
    pub name: String,
    pub source: String,
    pub run_on_init: String,
    pub run_on_init_restart: bool,
}

impl PathConfig {
    pub fn publisher(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            source: "publisher".to_string(),
            run_on_init: command.to_string(),
            run_on_init_restart: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfiguredPath {
    pub name: String,
    #[serde(default)]
    pub run_on_init: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimePath {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub readers: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// Client for the streaming backend's path-based HTTP config API. Every
/// request carries an explicit timeout so one stalled call never blocks a
/// reconciliation cycle.
pub struct BackendClient {
    api_base: String,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(api_base: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            http,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.api_base, endpoint)
    }

    pub async fn is_available(&self) -> bool {
        self.http
            .get(self.url("/v3/config/global/get"))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    pub async fn wait_for_available(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_available().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    pub async fn add_path(&self, config: &PathConfig) -> anyhow::Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/v3/config/paths/add/{}", config.name)))
            .json(config)
            .send()
            .await?;
        check_status(response).await?;
        log::info!("backend: added path {}", config.name);
        Ok(())
    }

    /// Patch an existing path's configuration in place. The backend does
    /// not restart a running publisher process for a patch.
    pub async fn patch_path(&self, config: &PathConfig) -> anyhow::Result<()> {
        let response = self
            .http
            .patch(self.url(&format!("/v3/config/paths/patch/{}", config.name)))
            .json(config)
            .send()
            .await?;
        check_status(response).await?;
        log::info!("backend: patched path {}", config.name);
        Ok(())
    }

    /// Delete a path. A path that is already absent counts as success.
    pub async fn delete_path(&self, name: &str) -> anyhow::Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/v3/config/paths/delete/{}", name)))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response).await?;
        log::info!("backend: removed path {}", name);
        Ok(())
    }

    /// List configured paths with their init commands.
    pub async fn list_paths(&self) -> anyhow::Result<Vec<ConfiguredPath>> {
        let response = self
            .http
            .get(self.url("/v3/config/paths/list"))
            .send()
            .await?;
        let response = check_status(response).await?;
        let list: ItemList<ConfiguredPath> = response.json().await?;
        Ok(list.items)
    }

    /// List live runtime paths (readiness, reader count).
    pub async fn list_runtime_paths(&self) -> anyhow::Result<Vec<RuntimePath>> {
        let response = self.http.get(self.url("/v3/paths/list")).send().await?;
        let response = check_status(response).await?;
        let list: ItemList<RuntimePath> = response.json().await?;
        Ok(list.items)
    }
}

async fn check_status(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(anyhow::anyhow!("backend returned {}: {}", status, body.trim()))
}
