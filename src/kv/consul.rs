//! Consul-compatible wire transport for the KV Handler: encodes a chunk of
//! [`KvOp`]s as a Consul `/v1/txn` request body and decodes the response.

use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::config::ConsulConfig;
use crate::reconcile::SentinelStore;

use super::{KvError, KvOp, KvTransport, TxnOutcome};

#[derive(Clone)]
pub struct ConsulTransport {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl ConsulTransport {
    pub fn new(cfg: &ConsulConfig) -> Result<Self, KvError> {
        let scheme = if cfg.ssl_enable { "https" } else { "http" };
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));

        if cfg.tls_config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if !cfg.tls_config.ca_file.is_empty() {
            let pem = std::fs::read(&cfg.tls_config.ca_file)
                .map_err(|e| KvError::Transport(anyhow::anyhow!("reading CA file: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| KvError::Transport(anyhow::anyhow!("parsing CA file: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if !cfg.tls_config.cert_file.is_empty() && !cfg.tls_config.key_file.is_empty() {
            let mut pem = std::fs::read(&cfg.tls_config.cert_file)
                .map_err(|e| KvError::Transport(anyhow::anyhow!("reading client cert: {e}")))?;
            let mut key = std::fs::read(&cfg.tls_config.key_file)
                .map_err(|e| KvError::Transport(anyhow::anyhow!("reading client key: {e}")))?;
            pem.append(&mut key);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| KvError::Transport(anyhow::anyhow!("building client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| KvError::Transport(anyhow::anyhow!(e)))?;

        let address = if cfg.address.is_empty() { "127.0.0.1:8500" } else { &cfg.address };
        Ok(Self {
            client,
            base_url: format!("{scheme}://{address}"),
            token: cfg.token.clone(),
        })
    }
}

#[derive(Serialize)]
#[serde(tag = "Verb")]
enum WireOp {
    #[serde(rename = "set")]
    Set { #[serde(rename = "Key")] key: String, #[serde(rename = "Value")] value: String },
    #[serde(rename = "delete")]
    Delete { #[serde(rename = "Key")] key: String },
    #[serde(rename = "delete-tree")]
    DeleteTree { #[serde(rename = "Key")] key: String },
    #[serde(rename = "check-index")]
    CheckIndex { #[serde(rename = "Key")] key: String, #[serde(rename = "Index")] index: u64 },
}

#[derive(Serialize)]
struct WireTxnItem {
    #[serde(rename = "KV")]
    kv: WireOp,
}

fn encode(ops: &[KvOp]) -> Vec<WireTxnItem> {
    ops.iter()
        .map(|op| WireTxnItem {
            kv: match op.clone() {
                KvOp::Put { key, value } => {
                    WireOp::Set { key, value: base64::engine::general_purpose::STANDARD.encode(value) }
                }
                KvOp::Delete { key } => WireOp::Delete { key },
                KvOp::DeleteSubtree { key } => WireOp::DeleteTree { key },
                KvOp::CheckIndex { key, index } => WireOp::CheckIndex { key, index },
            },
        })
        .collect()
}

#[derive(Deserialize)]
struct TxnError {
    #[serde(rename = "What")]
    what: String,
}

#[derive(Deserialize)]
struct TxnResponse {
    #[serde(default, rename = "Errors")]
    errors: Option<Vec<TxnError>>,
}

impl KvTransport for ConsulTransport {
    async fn txn(&self, ops: &[KvOp]) -> Result<TxnOutcome, KvError> {
        let body = encode(ops);
        let mut req = self.client.put(format!("{}/v1/txn", self.base_url)).json(&body);
        if !self.token.is_empty() {
            req = req.header("X-Consul-Token", &self.token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| KvError::Transport(anyhow::anyhow!(e)))?;

        let status = resp.status();
        if status.as_u16() == 409 {
            let parsed: TxnResponse = resp
                .json()
                .await
                .map_err(|e| KvError::Transport(anyhow::anyhow!(e)))?;
            let errors = parsed
                .errors
                .unwrap_or_default()
                .into_iter()
                .map(|e| e.what)
                .collect();
            return Ok(TxnOutcome::RolledBack(errors));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(KvError::Transport(anyhow::anyhow!(
                "KV store returned {status}: {text}"
            )));
        }
        Ok(TxnOutcome::Ok)
    }
}

impl SentinelStore for ConsulTransport {
    /// `GET /v1/kv/<key>?raw`. Consul returns 404 when the key is absent,
    /// which we map to `Ok(None)` ("never synced") rather than an error.
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut req = self
            .client
            .get(format!("{}/v1/kv/{}?raw", self.base_url, key));
        if !self.token.is_empty() {
            req = req.header("X-Consul-Token", &self.token);
        }
        let resp = req.send().await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("GET {key} returned {}", resp.status());
        }
        Ok(Some(resp.text().await?))
    }
}

#[cfg(test)]
mod tests {
    use httptest::{matchers::*, responders::*, Expectation, Server};

    use super::*;
    use crate::config::ConsulTlsConfig;

    fn cfg(addr: &str) -> ConsulConfig {
        ConsulConfig {
            address: addr.to_owned(),
            token: String::new(),
            ssl_enable: false,
            tls_config: ConsulTlsConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_txn_success() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("PUT", "/v1/txn"))
                .respond_with(status_code(200).body("[]")),
        );

        let transport = ConsulTransport::new(&cfg(&server.addr().to_string())).unwrap();
        let outcome = transport
            .txn(&[KvOp::Put { key: "a".to_owned(), value: b"b".to_vec() }])
            .await
            .unwrap();
        assert_eq!(outcome, TxnOutcome::Ok);
    }

    #[tokio::test]
    async fn test_txn_rolled_back() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("PUT", "/v1/txn")).respond_with(
                status_code(409).body(r#"{"Errors":[{"OpIndex":0,"What":"index mismatch"}]}"#),
            ),
        );

        let transport = ConsulTransport::new(&cfg(&server.addr().to_string())).unwrap();
        let outcome = transport
            .txn(&[KvOp::CheckIndex { key: "a".to_owned(), index: 3 }])
            .await
            .unwrap();
        assert_eq!(outcome, TxnOutcome::RolledBack(vec!["index mismatch".to_owned()]));
    }
}
