//! Consul HTTP store.
//!
//! Speaks the Consul KV HTTP API directly:
//! - `GET /v1/status/leader` as the connection check
//! - blocking `GET /v1/kv/<prefix>?recurse&index=` for watches
//! - `PUT /v1/kv/<key>` for writes; TTL writes acquire the key with a session
//!   created with `Behavior=delete`, renewed on every TTL write

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use super::endpoint::Endpoint;
use super::store::{Connector, KvPair, Store, StoreError};

const INDEX_HEADER: &str = "X-Consul-Index";
const SESSION_NAME: &str = "plinth-agent";

/// Opens [`ConsulStore`]s for `consul://` URLs.
pub struct ConsulConnector {
    timeout: Duration,
    wait: Duration,
}

impl ConsulConnector {
    /// `timeout` bounds plain requests, `wait` bounds blocking queries.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            wait: Duration::from_secs(300),
        }
    }

    /// Override the blocking query wait.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

#[async_trait]
impl Connector for ConsulConnector {
    fn supports(&self, scheme: &str) -> bool {
        scheme == "consul"
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Store>, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.timeout)
            .build()?;

        let mut last_error = None;
        for address in endpoint.addresses() {
            let base_url = base_url(address);
            let url = format!("{base_url}/v1/status/leader");
            debug!(url = %url, "Probing consul");

            match client.get(&url).timeout(self.timeout).send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(Arc::new(ConsulStore {
                        client,
                        base_url,
                        timeout: self.timeout,
                        wait: self.wait,
                        session: Mutex::new(None),
                    }));
                }
                Ok(response) => {
                    let status = response.status();
                    warn!(address = %address, status = %status, "Consul leader check rejected");
                    last_error = Some(StoreError::Unavailable(format!("{address}: {status}")));
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Consul leader check failed");
                    last_error = Some(StoreError::Http(e));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| StoreError::Unavailable("no addresses".to_string())))
    }
}

fn base_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.trim_end_matches('/').to_string()
    } else {
        format!("http://{address}")
    }
}

/// Consul KV client bound to one agent address.
pub struct ConsulStore {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    wait: Duration,
    session: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulEntry {
    key: String,
    value: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest<'a> {
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    behavior: &'a str,
    lock_delay: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(rename = "ID")]
    id: String,
}

impl ConsulStore {
    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, key)
    }

    /// One blocking query. Returns the subtree and the new index.
    ///
    /// Consul matches `recurse` as a plain string prefix, so the query carries
    /// a trailing `/` and sibling keys such as `nodes_old/x` are filtered out.
    async fn fetch_tree(&self, prefix: &str, index: u64) -> Result<(Vec<KvPair>, u64), StoreError> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        let response = self
            .client
            .get(self.kv_url(&dir))
            .query(&[
                ("recurse", "true".to_string()),
                ("index", index.to_string()),
                ("wait", format!("{}s", self.wait.as_secs())),
            ])
            .timeout(self.wait + self.timeout)
            .send()
            .await?;

        let status = response.status();
        let new_index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| StoreError::Protocol(format!("missing {INDEX_HEADER} ({status})")))?;

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok((Vec::new(), new_index));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Protocol(format!("watch {prefix}: {status} - {body}")));
        }

        let entries: Vec<ConsulEntry> = response.json().await?;
        let pairs = entries
            .into_iter()
            .filter(|e| e.key.starts_with(&dir) && !e.key.ends_with('/'))
            .map(|e| {
                let value = match e.value {
                    Some(encoded) => Some(decode_value(&encoded)?),
                    None => None,
                };
                Ok(KvPair { key: e.key, value })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok((pairs, new_index))
    }

    /// Renew the cached session or create a new one.
    async fn session(&self, ttl: Duration) -> Result<String, StoreError> {
        let mut session = self.session.lock().await;

        if let Some(id) = session.as_ref() {
            let url = format!("{}/v1/session/renew/{}", self.base_url, id);
            let response = self.client.put(&url).timeout(self.timeout).send().await?;
            if response.status().is_success() {
                trace!(session = %id, "Session renewed");
                return Ok(id.clone());
            }
            debug!(session = %id, status = %response.status(), "Session expired");
        }

        let request = SessionRequest {
            name: SESSION_NAME,
            ttl: format!("{}s", ttl.as_secs().max(10)),
            behavior: "delete",
            lock_delay: "0s",
        };
        let url = format!("{}/v1/session/create", self.base_url);
        let response = self
            .client
            .put(&url)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Protocol(format!("create session: {status} - {body}")));
        }
        let created: SessionResponse = response.json().await?;
        debug!(session = %created.id, "Session created");
        *session = Some(created.id.clone());
        Ok(created.id)
    }
}

fn decode_value(encoded: &str) -> Result<String, StoreError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| StoreError::Protocol(format!("invalid value encoding: {e}")))?;
    String::from_utf8(bytes).map_err(|e| StoreError::Protocol(format!("invalid utf-8 value: {e}")))
}

#[async_trait]
impl Store for ConsulStore {
    async fn watch_tree(&self, prefix: &str) -> Result<mpsc::Receiver<Vec<KvPair>>, StoreError> {
        let (pairs, mut index) = self.fetch_tree(prefix, 0).await?;

        let (tx, rx) = mpsc::channel(1);
        let store = ConsulStore {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            timeout: self.timeout,
            wait: self.wait,
            session: Mutex::new(None),
        };
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            if tx.send(pairs).await.is_err() {
                return;
            }
            loop {
                let fetched = tokio::select! {
                    fetched = store.fetch_tree(&prefix, index) => fetched,
                    () = tx.closed() => return,
                };
                match fetched {
                    Ok((pairs, new_index)) => {
                        if new_index == index {
                            trace!(prefix = %prefix, index, "Blocking query timed out");
                            continue;
                        }
                        // Index going backwards means the raft log was reset.
                        index = if new_index < index { 0 } else { new_index };
                        if tx.send(pairs).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(prefix = %prefix, error = %e, "Consul watch lost");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut request = self
            .client
            .put(self.kv_url(key))
            .body(value.to_string())
            .timeout(self.timeout);
        if let Some(ttl) = ttl {
            let session = self.session(ttl).await?;
            request = request.query(&[("acquire", session)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Protocol(format!("put {key}: {status} - {body}")));
        }
        let accepted: bool = response.json().await?;
        if !accepted {
            return Err(StoreError::Protocol(format!("put {key}: rejected")));
        }
        Ok(())
    }

    /// Consul deletes are idempotent, so absent keys never report `NotFound`.
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .delete(self.kv_url(key))
            .timeout(self.timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Protocol(format!("delete {key}: {status} - {body}")));
        }
        Ok(())
    }
}
