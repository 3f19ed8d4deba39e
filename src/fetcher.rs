//! External HTTP data fetching with bounded retries and dotted-path
//! JSON extraction. Grounded on `opensub-aa`'s `reqwest` usage (the
//! only reqwest precedent in the surrounding codebase) and on
//! `opensub-keeper`'s `scanner.rs` retry/backoff shape, generalized
//! from "retry `eth_getLogs`" to "retry an arbitrary HTTP GET".

use crate::errors::OracleError;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FetchOpts {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub decimals: u32,
}

impl Default for FetchOpts {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            timeout: Duration::from_secs(5),
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            decimals: 8,
        }
    }
}

/// Either a plain URL, or a fingerprint that must be resolved through
/// the indirection map before any network call, so log/metric surfaces
/// never carry the true URL for obscured sources.
#[derive(Debug, Clone)]
pub enum FetchSource {
    Url(String),
    Fingerprint(String),
}

impl FetchSource {
    /// The label safe to put in logs/metrics: the URL itself for plain
    /// sources, the fingerprint (never the resolved URL) for obscured
    /// ones.
    pub fn label(&self) -> &str {
        match self {
            FetchSource::Url(u) => u,
            FetchSource::Fingerprint(f) => f,
        }
    }
}

pub struct Fetcher {
    client: reqwest::Client,
    indirection: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub raw: Vec<u8>,
    pub value: i128,
}

impl Fetcher {
    pub fn new(indirection: HashMap<String, String>) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| OracleError::Config(format!("building http client: {e}")))?;
        Ok(Self { client, indirection })
    }

    fn resolve<'a>(&'a self, source: &'a FetchSource) -> Result<&'a str, OracleError> {
        match source {
            FetchSource::Url(u) => Ok(u.as_str()),
            FetchSource::Fingerprint(fp) => {
                self.indirection.get(fp).map(|s| s.as_str()).ok_or_else(|| {
                    OracleError::PermanentFetchFailure(format!(
                        "no indirection entry for fingerprint {fp}"
                    ))
                })
            }
        }
    }

    /// Fetches `source`, retrying transient failures per `opts`, and
    /// extracts the value at `json_path` scaled to an integer with
    /// `opts.decimals` fixed-point digits.
    pub async fn fetch(
        &self,
        source: &FetchSource,
        json_path: &str,
        opts: &FetchOpts,
    ) -> Result<FetchResult, OracleError> {
        let label = source.label().to_string();
        let url = self.resolve(source)?;

        let mut delay = opts.base_backoff;
        let mut last_err: Option<OracleError> = None;

        for attempt in 1..=opts.max_attempts.max(1) {
            match self.try_once(url, opts.timeout).await {
                Ok(raw) => {
                    let value = extract_scaled(&raw, json_path, opts.decimals)?;
                    return Ok(FetchResult { raw, value });
                }
                Err(err) if err.0 => {
                    // transient
                    tracing::warn!(source = %label, attempt, max = opts.max_attempts, error = %err.1, "fetch attempt failed; retrying");
                    last_err = Some(OracleError::TransientFetchFailure(err.1));
                    if attempt == opts.max_attempts {
                        break;
                    }
                    let jitter_factor = rand::thread_rng().gen_range(0.5..1.5);
                    let sleep_ms = (delay.as_millis() as f64 * jitter_factor) as u64;
                    tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                    delay = (delay * 2).min(opts.max_backoff);
                }
                Err(err) => {
                    return Err(OracleError::PermanentFetchFailure(err.1));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            OracleError::TransientFetchFailure(format!("exhausted retries for {label}"))
        }))
    }

    /// Returns `Ok(body)` on success, or `Err((is_retryable, message))`.
    async fn try_once(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, (bool, String)> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| (true, e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            resp.bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| (true, e.to_string()))
        } else if status.as_u16() == 429 || status.is_server_error() {
            Err((true, format!("http {status}")))
        } else {
            Err((false, format!("http {status}")))
        }
    }
}

/// Evaluates a dotted path (e.g. `data.price`, `items.0.close`) over a
/// JSON body and scales the numeric leaf to an integer with `decimals`
/// fixed-point digits, rounding ties away from zero.
fn extract_scaled(body: &[u8], path: &str, decimals: u32) -> Result<i128, OracleError> {
    let root: Value = serde_json::from_slice(body)
        .map_err(|e| OracleError::PermanentFetchFailure(format!("invalid JSON body: {e}")))?;

    let mut current = &root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment).ok_or_else(|| {
                OracleError::PermanentFetchFailure(format!("path segment '{segment}' not found"))
            })?,
            Value::Array(arr) => {
                let idx: usize = segment.parse().map_err(|_| {
                    OracleError::PermanentFetchFailure(format!(
                        "path segment '{segment}' is not a valid array index"
                    ))
                })?;
                arr.get(idx).ok_or_else(|| {
                    OracleError::PermanentFetchFailure(format!("array index {idx} out of bounds"))
                })?
            }
            _ => {
                return Err(OracleError::PermanentFetchFailure(format!(
                    "cannot descend into '{segment}': not an object or array"
                )))
            }
        };
    }

    let raw: f64 = match current {
        Value::Number(n) => n.as_f64().ok_or_else(|| {
            OracleError::PermanentFetchFailure("numeric value not representable".to_string())
        })?,
        Value::String(s) => s.parse().map_err(|_| {
            OracleError::PermanentFetchFailure(format!("value '{s}' is not numeric"))
        })?,
        _ => {
            return Err(OracleError::PermanentFetchFailure(
                "extracted value is not numeric".to_string(),
            ))
        }
    };

    let scale = 10f64.powi(decimals as i32);
    let scaled = raw * scale;
    Ok(scaled.round() as i128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_nested_path() {
        let body = br#"{"data":{"price":3847.52}}"#;
        let v = extract_scaled(body, "data.price", 8).unwrap();
        assert_eq!(v, 384752000000);
    }

    #[test]
    fn extracts_array_index() {
        let body = br#"{"items":[{"close":1.5},{"close":2.25}]}"#;
        let v = extract_scaled(body, "items.1.close", 2).unwrap();
        assert_eq!(v, 225);
    }

    #[test]
    fn missing_path_is_permanent_error() {
        let body = br#"{"data":{}}"#;
        let err = extract_scaled(body, "data.price", 8).unwrap_err();
        assert!(matches!(err, OracleError::PermanentFetchFailure(_)));
    }

    #[test]
    fn fingerprint_label_never_exposes_url() {
        let source = FetchSource::Fingerprint("src-1".to_string());
        assert_eq!(source.label(), "src-1");
    }
}
