//! External reputation service client.
//!
//! Wraps the HTTP check/report API behind the score cache in
//! [`AbuseStore`]. Checks fail open: any transport or decoding error
//! caches the `-1` sentinel for the normal TTL so an outage neither
//! blocks traffic nor hammers the service. Reports are suppressed by the
//! [`REPORTED_BY_US`] sentinel; the read-then-write gap between two
//! concurrent reporters is tolerated because the service deduplicates on
//! its side.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sixgate_core::{SixgateError, SixgateResult};

use crate::abuse::store::{AbuseStore, KnownPattern, REPORTED_BY_US};
use crate::logbatch::LogBatch;

const DEFAULT_BASE_URL: &str = "https://api.abuseipdb.com/api/v2";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct CheckResponse {
    data: CheckData,
}

#[derive(Debug, Deserialize)]
struct CheckData {
    #[serde(rename = "abuseConfidenceScore")]
    abuse_confidence_score: i64,
}

pub struct ReputationClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    store: Arc<AbuseStore>,
    ip_expire: Duration,
}

impl ReputationClient {
    pub fn new(store: Arc<AbuseStore>, api_key: String, ip_expire: Duration) -> SixgateResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| SixgateError::Reputation(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            store,
            ip_expire,
        })
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Confidence score for `ip`: the fresh cached value if there is one,
    /// otherwise one bounded HTTP call. Never fails; errors come back as
    /// `-1` and are cached like any other result.
    pub async fn check(&self, ip: IpAddr, log: &mut LogBatch) -> i64 {
        let ip_str = ip.to_string();

        match self.store.fresh_score(&ip_str, self.ip_expire).await {
            Ok(Some(score)) => {
                log.push("reputation cache hit");
                return score;
            }
            Ok(None) => log.push("reputation cache miss"),
            Err(e) => log.push(format!("reputation cache error: {e}")),
        }

        let score = match self.fetch_score(&ip_str).await {
            Ok(score) => score,
            Err(e) => {
                // fail open
                log.push(format!("reputation request error: {e}"));
                -1
            }
        };

        if let Err(e) = self.store.set_score(&ip_str, score).await {
            log.push(format!("reputation cache write error: {e}"));
        }
        score
    }

    async fn fetch_score(&self, ip: &str) -> SixgateResult<i64> {
        let resp = self
            .http
            .get(format!("{}/check", self.base_url))
            .query(&[("key", self.api_key.as_str()), ("ipAddress", ip)])
            .send()
            .await
            .map_err(|e| SixgateError::Reputation(e.to_string()))?;
        let body: CheckResponse = resp
            .json()
            .await
            .map_err(|e| SixgateError::Reputation(e.to_string()))?;
        Ok(body.data.abuse_confidence_score)
    }

    /// Report `ip` for sending a confirmed abuse pattern.
    ///
    /// The cache is set to [`REPORTED_BY_US`] *before* the POST so that a
    /// crashed request still suppresses re-reports for the TTL. A non-2xx
    /// response is logged and not retried.
    pub async fn report(&self, ip: IpAddr, pattern: &KnownPattern, log: &mut LogBatch) {
        let ip_str = ip.to_string();

        match self.store.raw_score(&ip_str).await {
            Ok(Some(REPORTED_BY_US)) => {
                log.push("this IP has already been reported");
                return;
            }
            Ok(_) => {}
            Err(e) => log.push(format!("reputation cache error: {e}")),
        }

        if let Err(e) = self.store.set_score(&ip_str, REPORTED_BY_US).await {
            log.push(format!("reputation cache write error: {e}"));
        }

        log.push(format!("reporting {ip_str} for pattern {}", pattern.hash));
        let result = self
            .http
            .post(format!("{}/report", self.base_url))
            .query(&[("key", self.api_key.as_str())])
            .form(&[
                ("ip", ip_str.as_str()),
                ("categories", pattern.category.as_str()),
                ("comment", pattern.comment.as_str()),
            ])
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                log.push(format!("error when submitting abuse report: {status} {body}"));
            }
            Err(e) => log.push(format!("error when submitting abuse report: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logbatch::Drainer;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn store() -> (tempfile::TempDir, Arc<AbuseStore>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(AbuseStore::open(&dir.path().join("abuse.sqlite")).unwrap());
        (dir, store)
    }

    fn batch() -> LogBatch {
        Drainer::spawn().batch(0.8)
    }

    /// Minimal HTTP server counting requests; always answers 200 and
    /// closes, so each request costs one connection.
    async fn spawn_counting_http(counter: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn failed_check_caches_fail_open_sentinel() {
        let (_dir, store) = store();
        // nothing listens on port 9; the request fails fast
        let client = ReputationClient::new(store.clone(), "key".into(), Duration::from_secs(3600))
            .unwrap()
            .with_base_url("http://127.0.0.1:9");

        let ip: IpAddr = Ipv4Addr::new(192, 0, 2, 7).into();
        let mut log = batch();
        assert_eq!(client.check(ip, &mut log).await, -1);

        // the sentinel is cached, so the next check is answered locally
        assert_eq!(
            store
                .fresh_score("192.0.2.7", Duration::from_secs(3600))
                .await
                .unwrap(),
            Some(-1)
        );
        assert_eq!(client.check(ip, &mut log).await, -1);
    }

    #[tokio::test]
    async fn check_prefers_fresh_cache() {
        let (_dir, store) = store();
        store.set_score("192.0.2.8", 77).await.unwrap();
        let client = ReputationClient::new(store, "key".into(), Duration::from_secs(3600))
            .unwrap()
            .with_base_url("http://127.0.0.1:9");

        let ip: IpAddr = Ipv4Addr::new(192, 0, 2, 8).into();
        let mut log = batch();
        // a dead base URL proves no request was made
        assert_eq!(client.check(ip, &mut log).await, 77);
    }

    #[tokio::test]
    async fn report_posts_exactly_once() {
        let (_dir, store) = store();
        let counter = Arc::new(AtomicUsize::new(0));
        let base = spawn_counting_http(counter.clone()).await;
        let client = ReputationClient::new(store.clone(), "key".into(), Duration::from_secs(3600))
            .unwrap()
            .with_base_url(base);

        let pattern = KnownPattern {
            hash: "00ff".into(),
            category: "14".into(),
            comment: "probe".into(),
        };
        let ip: IpAddr = Ipv4Addr::new(192, 0, 2, 9).into();

        let mut log = batch();
        client.report(ip, &pattern, &mut log).await;
        client.report(ip, &pattern, &mut log).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1, "second report suppressed");
        assert_eq!(
            store.raw_score("192.0.2.9").await.unwrap(),
            Some(REPORTED_BY_US)
        );
    }
}
