//! ---
//! cmc_section: "07-resilience-fault-tolerance"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Consensus store access and replica membership."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
//! etcd v3 client speaking the JSON gateway (`/v3/kv/*`).
//!
//! Keys and values travel base64 encoded and 64-bit integers as decimal strings. Requests
//! go to the last endpoint that answered and fail over to the next on transport errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cmc_persistence::StoreError;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use tracing::{debug, warn};
use url::Url;

use crate::store::{ConsensusStore, Versioned};

#[serde_as]
#[derive(Debug, Default, Deserialize)]
struct ResponseHeader {
    #[serde(default)]
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    revision: u64,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    mod_revision: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Serialize)]
struct RangeRequest {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    range_end: Option<String>,
}

#[derive(Debug, Serialize)]
struct PutRequest {
    key: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct PutResponse {
    #[serde(default)]
    header: ResponseHeader,
}

#[derive(Debug, Serialize)]
struct DeleteRequest {
    key: String,
}

#[derive(Debug, Serialize)]
struct Compare {
    key: String,
    result: &'static str,
    target: &'static str,
    mod_revision: String,
}

#[derive(Debug, Serialize)]
struct TxnRequest {
    compare: Vec<Compare>,
    success: Vec<serde_json::Value>,
    failure: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TxnResponseOp {
    #[serde(default)]
    response_range: Option<RangeResponse>,
}

#[derive(Debug, Default, Deserialize)]
struct TxnResponse {
    #[serde(default)]
    header: ResponseHeader,
    #[serde(default)]
    succeeded: bool,
    #[serde(default)]
    responses: Vec<TxnResponseOp>,
}

fn encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

fn decode(field: &str, encoded: &str) -> Result<Vec<u8>, StoreError> {
    BASE64
        .decode(encoded)
        .map_err(|err| StoreError::Codec(format!("{} is not base64: {}", field, err)))
}

/// Smallest key strictly greater than every key starting with `prefix`.
fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Every byte was 0xff: "\0" asks etcd for all keys >= prefix.
    vec![0]
}

/// [`ConsensusStore`] backed by an etcd cluster.
#[derive(Debug)]
pub struct EtcdGatewayStore {
    client: Client,
    endpoints: Vec<Url>,
    preferred: AtomicUsize,
}

impl EtcdGatewayStore {
    pub fn new(endpoints: &[String], timeout: Duration) -> Result<Self, StoreError> {
        if endpoints.is_empty() {
            return Err(StoreError::Unavailable("no consensus endpoints configured".into()));
        }
        let endpoints = endpoints
            .iter()
            .map(|endpoint| {
                Url::parse(endpoint).map_err(|err| {
                    StoreError::Unavailable(format!("invalid endpoint {}: {}", endpoint, err))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            endpoints,
            preferred: AtomicUsize::new(0),
        })
    }

    async fn call<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, StoreError> {
        let start = self.preferred.load(Ordering::Relaxed);
        let mut last_error = String::new();
        for offset in 0..self.endpoints.len() {
            let index = (start + offset) % self.endpoints.len();
            let endpoint = &self.endpoints[index];
            let url = endpoint
                .join(path)
                .map_err(|err| StoreError::Unavailable(err.to_string()))?;
            let response = match self.client.post(url).json(body).send().await {
                Ok(response) => response,
                Err(err) => {
                    warn!(endpoint = %endpoint, error = %err, "consensus endpoint unreachable");
                    last_error = err.to_string();
                    continue;
                }
            };
            if response.status().is_server_error() {
                last_error = format!("{} answered {}", endpoint, response.status());
                warn!(endpoint = %endpoint, status = %response.status(), "consensus endpoint failed");
                continue;
            }
            let response = response
                .error_for_status()
                .map_err(|err| StoreError::Unavailable(err.to_string()))?;
            self.preferred.store(index, Ordering::Relaxed);
            return response
                .json::<R>()
                .await
                .map_err(|err| StoreError::Codec(err.to_string()));
        }
        Err(StoreError::Unavailable(format!(
            "all consensus endpoints failed: {}",
            last_error
        )))
    }

    async fn range(&self, key: &str, range_end: Option<Vec<u8>>) -> Result<Vec<(String, Versioned)>, StoreError> {
        let request = RangeRequest {
            key: encode(key.as_bytes()),
            range_end: range_end.map(|end| encode(&end)),
        };
        let response: RangeResponse = self.call("v3/kv/range", &request).await?;
        response
            .kvs
            .into_iter()
            .map(|kv| {
                let key = String::from_utf8(decode("key", &kv.key)?)
                    .map_err(|err| StoreError::Codec(err.to_string()))?;
                let value = decode("value", &kv.value)?;
                Ok((
                    key,
                    Versioned {
                        value,
                        revision: kv.mod_revision,
                    },
                ))
            })
            .collect()
    }
}

#[async_trait]
impl ConsensusStore for EtcdGatewayStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        Ok(self
            .range(key, None)
            .await?
            .into_iter()
            .next()
            .map(|(_, value)| value))
    }

    async fn put_if(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<u64, StoreError> {
        let encoded_key = encode(key.as_bytes());
        let request = TxnRequest {
            compare: vec![Compare {
                key: encoded_key.clone(),
                result: "EQUAL",
                target: "MOD",
                mod_revision: expected_revision.to_string(),
            }],
            success: vec![serde_json::json!({
                "request_put": { "key": encoded_key, "value": encode(&value) }
            })],
            failure: vec![serde_json::json!({
                "request_range": { "key": encoded_key }
            })],
        };
        let response: TxnResponse = self.call("v3/kv/txn", &request).await?;
        if response.succeeded {
            debug!(key, revision = response.header.revision, "conditional put committed");
            return Ok(response.header.revision);
        }
        let actual = response
            .responses
            .into_iter()
            .filter_map(|op| op.response_range)
            .flat_map(|range| range.kvs)
            .map(|kv| kv.mod_revision)
            .next()
            .unwrap_or(0);
        Err(StoreError::Conflict {
            expected: expected_revision,
            actual,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StoreError> {
        let request = PutRequest {
            key: encode(key.as_bytes()),
            value: encode(&value),
        };
        let response: PutResponse = self.call("v3/kv/put", &request).await?;
        Ok(response.header.revision)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let request = DeleteRequest {
            key: encode(key.as_bytes()),
        };
        let _: serde_json::Value = self.call("v3/kv/deleterange", &request).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError> {
        self.range(prefix, Some(prefix_range_end(prefix.as_bytes())))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_end_increments_last_byte() {
        assert_eq!(prefix_range_end(b"cmc/members/"), b"cmc/members0".to_vec());
        assert_eq!(prefix_range_end(&[0x61, 0xff]), vec![0x62]);
        assert_eq!(prefix_range_end(&[0xff]), vec![0]);
    }

    #[test]
    fn gateway_integers_may_be_strings_or_numbers() {
        let as_string: KeyValue =
            serde_json::from_str(r#"{"key":"YQ==","value":"Yg==","mod_revision":"42"}"#).unwrap();
        let as_number: KeyValue =
            serde_json::from_str(r#"{"key":"YQ==","mod_revision":7}"#).unwrap();
        assert_eq!(as_string.mod_revision, 42);
        assert_eq!(as_number.mod_revision, 7);
        assert_eq!(as_number.value, "");
    }

    #[test]
    fn empty_endpoint_list_is_rejected() {
        assert!(matches!(
            EtcdGatewayStore::new(&[], Duration::from_secs(1)),
            Err(StoreError::Unavailable(_))
        ));
    }
}
