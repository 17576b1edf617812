//! HTTP bridge client for the brokerage gateway
//!
//! Talks JSON to the gateway bridge process. Every call is bounded by the
//! configured timeout and retried with exponential backoff on transient
//! faults; an explicit reject from the bridge is terminal and never
//! retried.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::IbGatewayConfig;
use crate::error::{EngineError, EngineResult};
use crate::gateway::{AccountSummary, GatewayClient, OrderEvent, OrderStatusReport, Position};
use crate::marketdata::{Bar, BarRequest};
use crate::models::OrderPayload;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 200;
const EVENT_POLL_INTERVAL_MS: u64 = 1_000;
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct HttpGateway {
    client: Client,
    base_url: String,
    client_id: u32,
    timeout_seconds: u64,
    events: broadcast::Sender<OrderEvent>,
    event_cursor: Arc<Mutex<i64>>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    ib_order_id: String,
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    cursor: i64,
    events: Vec<OrderEvent>,
}

impl HttpGateway {
    pub fn new(cfg: &IbGatewayConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .user_agent("tradewatch/0.1")
            .build()
            .map_err(|e| EngineError::Config(format!("http client: {e}")))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            client,
            base_url: format!("http://{}:{}", cfg.host, cfg.port()),
            client_id: cfg.client_id,
            timeout_seconds: cfg.timeout_seconds,
            events,
            event_cursor: Arc::new(Mutex::new(0)),
        })
    }

    /// Background poller that drains the bridge's order-event feed into
    /// the broadcast channel. Runs until the process exits.
    pub fn spawn_event_poller(self: &Arc<Self>) {
        let gw = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = gw.poll_events_once().await {
                    warn!(error = %e, "order event poll failed");
                }
                sleep(Duration::from_millis(EVENT_POLL_INTERVAL_MS)).await;
            }
        });
    }

    async fn poll_events_once(&self) -> EngineResult<()> {
        let after = *self.event_cursor.lock();
        let url = format!("{}/v1/order-events?after={}", self.base_url, after);
        let resp = self.get_with_retry(&url).await?;
        let body: EventsResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::GatewayUnavailable(format!("decode events: {e}")))?;
        *self.event_cursor.lock() = body.cursor;
        for event in body.events {
            debug!(ib_order_id = %event.ib_order_id, status = ?event.status, "gateway order event");
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn get_with_retry(&self, url: &str) -> EngineResult<Response> {
        self.with_retry(|| self.client.get(url).send()).await
    }

    /// Bounded retry with exponential backoff and jitter. Only transient
    /// faults retry; rejects surface immediately.
    async fn with_retry<F, Fut>(&self, send: F) -> EngineResult<Response>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Response, reqwest::Error>>,
    {
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let mut last_err = EngineError::GatewayUnavailable("no attempt made".to_string());
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let jitter = rand::thread_rng().gen_range(0..backoff_ms / 2 + 1);
                sleep(Duration::from_millis(backoff_ms + jitter)).await;
                backoff_ms *= 2;
            }
            match send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                        last_err = EngineError::GatewayUnavailable(format!("bridge {status}"));
                        continue;
                    }
                    let detail = resp.text().await.unwrap_or_default();
                    return Err(EngineError::GatewayRejected(format!("{status}: {detail}")));
                }
                Err(e) if e.is_timeout() => {
                    last_err = EngineError::GatewayTimeout(self.timeout_seconds);
                }
                Err(e) => {
                    last_err = EngineError::GatewayUnavailable(e.to_string());
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl GatewayClient for HttpGateway {
    async fn health_check(&self) -> EngineResult<()> {
        let url = format!("{}/v1/health", self.base_url);
        self.get_with_retry(&url).await.map(|_| ())
    }

    async fn fetch_bars(&self, req: &BarRequest) -> EngineResult<Vec<Bar>> {
        let url = format!("{}/v1/bars", self.base_url);
        let body = json!({
            "client_id": self.client_id,
            "contract": req.contract,
            "bar_size": req.bar_size.as_str(),
            "start": req.start.to_rfc3339(),
            "end": req.end.to_rfc3339(),
            "what_to_show": req.what_to_show.as_str(),
            "use_rth": req.use_rth,
            "include_partial_bar": req.include_partial_bar,
        });
        let resp = self
            .with_retry(|| self.client.post(&url).json(&body).send())
            .await?;
        resp.json()
            .await
            .map_err(|e| EngineError::GatewayUnavailable(format!("decode bars: {e}")))
    }

    async fn submit_order(&self, payload: &OrderPayload) -> EngineResult<String> {
        let url = format!("{}/v1/orders", self.base_url);
        let resp = self
            .with_retry(|| self.client.post(&url).json(payload).send())
            .await?;
        let body: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::GatewayUnavailable(format!("decode submit: {e}")))?;
        Ok(body.ib_order_id)
    }

    async fn cancel_order(&self, ib_order_id: &str) -> EngineResult<()> {
        let url = format!("{}/v1/orders/{}/cancel", self.base_url, ib_order_id);
        self.with_retry(|| self.client.post(&url).send())
            .await
            .map(|_| ())
    }

    async fn order_status(&self, ib_order_id: &str) -> EngineResult<OrderStatusReport> {
        let url = format!("{}/v1/orders/{}", self.base_url, ib_order_id);
        let resp = self.get_with_retry(&url).await?;
        resp.json()
            .await
            .map_err(|e| EngineError::GatewayUnavailable(format!("decode status: {e}")))
    }

    async fn account_summary(&self) -> EngineResult<AccountSummary> {
        let url = format!("{}/v1/account", self.base_url);
        let resp = self.get_with_retry(&url).await?;
        resp.json()
            .await
            .map_err(|e| EngineError::GatewayUnavailable(format!("decode account: {e}")))
    }

    async fn positions(&self) -> EngineResult<Vec<Position>> {
        let url = format!("{}/v1/positions", self.base_url);
        let resp = self.get_with_retry(&url).await?;
        resp.json()
            .await
            .map_err(|e| EngineError::GatewayUnavailable(format!("decode positions: {e}")))
    }

    fn subscribe_order_events(&self) -> broadcast::Receiver<OrderEvent> {
        self.events.subscribe()
    }
}
