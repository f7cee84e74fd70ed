//! etcd v2 keys API client

use super::client::{KvClient, KvError, KvNode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

// etcd v2 error codes
const KEY_NOT_FOUND: u32 = 100;
const TEST_FAILED: u32 = 101;
const NODE_EXIST: u32 = 105;

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    #[serde(default)]
    node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdNode {
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    modified_index: u64,
    #[serde(default)]
    expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdErrorBody {
    error_code: u32,
    message: String,
    #[serde(default)]
    cause: Option<String>,
}

impl EtcdNode {
    fn into_leaves(self, out: &mut Vec<KvNode>) {
        if self.dir {
            for child in self.nodes {
                child.into_leaves(out);
            }
        } else if let (Some(key), Some(value)) = (self.key, self.value) {
            out.push(KvNode {
                key,
                value,
                modified_index: self.modified_index,
                expiration: self.expiration,
            });
        }
    }

    fn into_leaf(self, key: &str) -> Result<KvNode, KvError> {
        let mut leaves = Vec::with_capacity(1);
        self.into_leaves(&mut leaves);
        leaves
            .pop()
            .ok_or_else(|| KvError::Protocol(format!("{} is not a value node", key)))
    }
}

/// Client for the etcd v2 HTTP keys API
///
/// Every request is bounded by the configured timeout; a request that times
/// out or cannot connect fails with `KvError::Unavailable`.
#[derive(Clone, Debug)]
pub struct EtcdClient {
    http: reqwest::Client,
    base_url: String,
}

impl EtcdClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, KvError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| KvError::Unavailable(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/v2/keys{}", self.base_url, key)
    }

    async fn send(&self, request: RequestBuilder, key: &str) -> Result<EtcdResponse, KvError> {
        let response = request
            .send()
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;

        debug!("etcd {} -> {}", key, status);
        decode_response(status, &body, key)
    }

    fn write_form(value: &str, ttl: Option<Duration>) -> Vec<(&'static str, String)> {
        let mut form = vec![("value", value.to_string())];
        if let Some(ttl) = ttl {
            // etcd TTLs are whole seconds; round up so a lease never ends early
            let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
            form.push(("ttl", secs.max(1).to_string()));
        }
        form
    }
}

fn decode_response(status: StatusCode, body: &[u8], key: &str) -> Result<EtcdResponse, KvError> {
    if status.is_success() {
        return serde_json::from_slice(body).map_err(|e| KvError::Protocol(e.to_string()));
    }

    let err: EtcdErrorBody = match serde_json::from_slice(body) {
        Ok(err) => err,
        Err(_) if status.is_server_error() => {
            return Err(KvError::Unavailable(format!("etcd returned {}", status)))
        }
        Err(_) => return Err(KvError::Protocol(format!("etcd returned {}", status))),
    };

    let subject = err.cause.unwrap_or_else(|| key.to_string());
    Err(match err.error_code {
        KEY_NOT_FOUND => KvError::KeyNotFound(subject),
        TEST_FAILED => KvError::TestFailed(subject),
        NODE_EXIST => KvError::NodeExists(subject),
        _ if status.is_server_error() => KvError::Unavailable(err.message),
        code => KvError::Protocol(format!("error {}: {}", code, err.message)),
    })
}

fn expect_node(response: EtcdResponse, key: &str) -> Result<KvNode, KvError> {
    response
        .node
        .ok_or_else(|| KvError::Protocol(format!("no node in response for {}", key)))?
        .into_leaf(key)
}

#[async_trait]
impl KvClient for EtcdClient {
    async fn get(&self, key: &str) -> Result<KvNode, KvError> {
        let response = self.send(self.http.get(self.key_url(key)), key).await?;
        expect_node(response, key)
    }

    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<KvNode, KvError> {
        let request = self
            .http
            .put(self.key_url(key))
            .query(&[("prevExist", "false")])
            .form(&Self::write_form(value, ttl));
        let response = self.send(request, key).await?;
        expect_node(response, key)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        prev_index: u64,
    ) -> Result<KvNode, KvError> {
        let request = self
            .http
            .put(self.key_url(key))
            .query(&[("prevIndex", prev_index.to_string())])
            .form(&Self::write_form(value, ttl));
        let response = self.send(request, key).await?;
        expect_node(response, key)
    }

    async fn compare_and_delete(&self, key: &str, prev_index: u64) -> Result<(), KvError> {
        let request = self
            .http
            .delete(self.key_url(key))
            .query(&[("prevIndex", prev_index.to_string())]);
        self.send(request, key).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvNode>, KvError> {
        let dir = prefix.trim_end_matches('/');
        let request = self
            .http
            .get(self.key_url(dir))
            .query(&[("recursive", "true"), ("sorted", "true")]);

        let response = match self.send(request, dir).await {
            Ok(response) => response,
            Err(KvError::KeyNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut leaves = Vec::new();
        if let Some(node) = response.node {
            node.into_leaves(&mut leaves);
        }
        leaves.retain(|leaf| leaf.key.starts_with(prefix));
        leaves.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(leaves)
    }
}
