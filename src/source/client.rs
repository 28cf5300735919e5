use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::config::Config;
use crate::error::{AppError, FetchError, Result};
use crate::source::parse::{parse_feed, parse_sport_ids, FeedBatch};
use crate::types::Cursor;

/// Process-wide cap on upstream requests in flight. Callers wait for a permit.
#[derive(Debug, Clone)]
pub struct RequestGate(Arc<Semaphore>);

impl RequestGate {
    pub fn new(permits: usize) -> Self {
        Self(Arc::new(Semaphore::new(permits)))
    }

    pub async fn acquire(&self) -> std::result::Result<OwnedSemaphorePermit, FetchError> {
        Arc::clone(&self.0)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Transient("request gate closed".to_string()))
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.0.available_permits()
    }
}

/// Minimum spacing between consecutive requests of one sport stream.
#[derive(Debug)]
pub struct Pacer {
    spacing: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(spacing: Duration) -> Self {
        Self { spacing, last: None }
    }

    /// Sleeps until `spacing` has passed since the previous call returned.
    pub async fn wait(&mut self) {
        if let Some(last) = self.last {
            tokio::time::sleep_until(last + self.spacing).await;
        }
        self.last = Some(Instant::now());
    }
}

/// Client for the upstream odds feed.
pub struct SourceClient {
    http: reqwest::Client,
    markets_url: String,
    sports_url: String,
    gate: RequestGate,
}

impl SourceClient {
    pub fn new(cfg: &Config, gate: RequestGate) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-rapidapi-host",
            HeaderValue::from_str(&cfg.api_host)
                .map_err(|e| AppError::Config(format!("PINNACLE_API_HOST: {e}")))?,
        );
        let mut key = HeaderValue::from_str(&cfg.api_key)
            .map_err(|e| AppError::Config(format!("PINNACLE_API_KEY: {e}")))?;
        key.set_sensitive(true);
        headers.insert("x-rapidapi-key", key);

        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            markets_url: cfg.api_url.clone(),
            sports_url: cfg.sports_url.clone(),
            gate,
        })
    }

    /// One markets poll for `sport_id`. Without `since` the upstream returns the
    /// full board. Waits on the sport's pacer, then on the shared gate.
    pub async fn fetch(
        &self,
        pacer: &mut Pacer,
        sport_id: i64,
        since: Option<&Cursor>,
    ) -> std::result::Result<FeedBatch, FetchError> {
        pacer.wait().await;

        let mut query = vec![
            ("sport_id", sport_id.to_string()),
            ("is_have_odds", "true".to_string()),
        ];
        if let Some(cursor) = since {
            query.push(("since", cursor.0.clone()));
        }

        let body = self.get_json(&self.markets_url, &query).await?;
        let batch = parse_feed(&body)?;
        debug!(
            sport_id,
            events = batch.events.len(),
            malformed = batch.malformed.len(),
            cursor = ?batch.cursor,
            "Fetched markets"
        );
        Ok(batch)
    }

    /// Sport ids listed by the upstream sports endpoint.
    pub async fn fetch_sport_ids(&self) -> std::result::Result<Vec<i64>, FetchError> {
        let body = self.get_json(&self.sports_url, &[]).await?;
        parse_sport_ids(&body)
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<serde_json::Value, FetchError> {
        let _permit = self.gate.acquire().await?;

        let resp = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Transient(format!("upstream returned {status}")));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| FetchError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gate_bounds_concurrent_permits() {
        let gate = RequestGate::new(2);
        let a = gate.acquire().await.unwrap();
        let _b = gate.acquire().await.unwrap();
        assert_eq!(gate.available(), 0);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(a);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_consecutive_calls() {
        let mut pacer = Pacer::new(Duration::from_millis(200));
        let start = Instant::now();
        pacer.wait().await;
        pacer.wait().await;
        pacer.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn first_pacer_call_does_not_wait() {
        let mut pacer = Pacer::new(Duration::from_secs(5));
        let start = Instant::now();
        pacer.wait().await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }
}
