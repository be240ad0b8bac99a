//! Remote KV state store speaking the Consul HTTP KV API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::StateStore;
use crate::{Error, Result};

const DATA_ROOT: &str = "iterator::Data";

#[derive(Debug, Serialize, Deserialize)]
struct StoreStatus {
    iterator_status: String,
}

pub struct ConsulStore {
    client: reqwest::Client,
    base_url: String,
}

impl ConsulStore {
    pub fn new(address: &str) -> Self {
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address)
        };
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, key)
    }

    fn binding_path(&self, key: &str) -> String {
        format!("{}/process/alerts/{}", DATA_ROOT, key)
    }

    async fn get_raw(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let resp = self
            .client
            .get(self.kv_url(path))
            .query(&[("raw", "true")])
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(resp.bytes().await?.to_vec())),
            status => Err(Error::Store(format!(
                "failed to query key {}: HTTP {}",
                path, status
            ))),
        }
    }

    async fn put_raw(&self, path: &str, value: &[u8]) -> Result<()> {
        let resp = self
            .client
            .put(self.kv_url(path))
            .body(value.to_vec())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Store(format!(
                "failed to upload key {}: HTTP {}",
                path,
                resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for ConsulStore {
    /// Bootstrap the data store: write the status key if this is the first
    /// time the executor talks to this KV.
    async fn init(&self) -> Result<()> {
        let status_path = format!("{}/status", DATA_ROOT);
        info!("Checking if data store is initialized.");
        if self.get_raw(&status_path).await?.is_none() {
            info!("Data store is not initialized. Initializing..");
            let status = StoreStatus {
                iterator_status: "initialized".to_string(),
            };
            self.put_raw(&status_path, &serde_json::to_vec(&status)?)
                .await?;
            info!("Data store initialized successfully.");
        } else {
            info!("Data store is already initialized.");
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.get_raw(&self.binding_path(key)).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.put_raw(&self.binding_path(key), value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.binding_path(key);
        let resp = self.client.delete(self.kv_url(&path)).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Store(format!(
                "failed to delete key {}: HTTP {}",
                path,
                resp.status()
            )));
        }
        Ok(())
    }

    async fn list(&self, recursive: bool) -> Result<Vec<String>> {
        let prefix = format!("{}/process/alerts/", DATA_ROOT);
        let mut query: Vec<(&str, &str)> = vec![("keys", "true")];
        if !recursive {
            query.push(("separator", "/"));
        }
        let resp = self
            .client
            .get(self.kv_url(&prefix))
            .query(&query)
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => {
                let keys: Vec<String> = resp.json().await?;
                Ok(keys
                    .iter()
                    .filter(|k| k.as_str() != prefix)
                    .map(|k| k.trim_start_matches(&prefix).trim_end_matches('/'))
                    .filter(|k| !k.is_empty())
                    .map(|k| k.to_string())
                    .collect())
            }
            status => Err(Error::Store(format!(
                "failed to list keys at {}: HTTP {}",
                prefix, status
            ))),
        }
    }

    fn binding_key(&self, _fingerprint: &str, alert_name: &str) -> String {
        alert_name.to_string()
    }
}
