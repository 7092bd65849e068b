//! JSON-over-HTTP exchange adapter.
//!
//! Private calls are authenticated with three headers:
//! - `X-API-KEY`: the account's key
//! - `X-NONCE`: the call identifier issued by the account gate
//! - `X-SIGNATURE`: hex HMAC-SHA256 of `nonce + path + body` keyed by the secret

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use super::{Exchange, HeldPosition, PriceFeed};
use crate::error::ExchangeError;
use crate::models::{
    CallIdentifier, FillConfirmation, OrderRequest, OrderStatus, SizeType, TradeSide,
};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// API key and secret for one account.
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

impl ApiCredentials {
    /// Load from the named environment variables.
    pub fn from_env(key_var: &str, secret_var: &str) -> Result<Self> {
        let api_key = std::env::var(key_var)
            .with_context(|| format!("{} environment variable not set", key_var))?;
        let api_secret = std::env::var(secret_var)
            .with_context(|| format!("{} environment variable not set", secret_var))?;

        Ok(Self {
            api_key,
            api_secret,
        })
    }
}

/// Hex HMAC-SHA256 of `message` keyed by `secret`.
pub(crate) fn sign_message(secret: &str, message: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Auth(format!("HMAC init failed: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Map a non-success HTTP response to the error taxonomy.
pub(crate) fn classify(status: StatusCode, body: &str) -> ExchangeError {
    let detail = format!("{} - {}", status, body);
    let lower = body.to_lowercase();

    if status == StatusCode::TOO_MANY_REQUESTS {
        return ExchangeError::RateLimited(detail);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return ExchangeError::Auth(detail);
    }
    if status.is_server_error() {
        return ExchangeError::Network(detail);
    }

    let unsupported = ["unsupported symbol", "unknown symbol", "invalid symbol", "symbol not supported"];
    if unsupported.iter().any(|needle| lower.contains(needle)) {
        return ExchangeError::UnsupportedSymbol(detail);
    }

    ExchangeError::Rejected(detail)
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    available: Decimal,
}

#[derive(Debug, Serialize)]
struct OrderPayload<'a> {
    symbol: &'a str,
    side: TradeSide,
    size: Decimal,
    size_type: SizeType,
    #[serde(rename = "type")]
    order_type: &'static str,
}

#[derive(Debug, Serialize)]
struct ClosePayload<'a> {
    symbol: &'a str,
    side: TradeSide,
    quantity: Decimal,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order_id: String,
    status: OrderStatus,
    #[serde(default)]
    filled_quantity: Decimal,
    #[serde(default)]
    average_price: Decimal,
    filled_at: Option<DateTime<Utc>>,
}

impl From<OrderResponse> for FillConfirmation {
    fn from(resp: OrderResponse) -> Self {
        FillConfirmation {
            order_id: resp.order_id,
            status: resp.status,
            filled_quantity: resp.filled_quantity,
            fill_price: resp.average_price,
            filled_at: resp.filled_at.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    price: Decimal,
}

/// HTTP adapter for one account.
pub struct HttpExchange {
    name: String,
    http: Client,
    base_url: String,
    credentials: ApiCredentials,
}

impl HttpExchange {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, credentials: ApiCredentials) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            name: name.into(),
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn private_headers(
        &self,
        nonce: CallIdentifier,
        path: &str,
        body: &str,
    ) -> Result<HeaderMap, ExchangeError> {
        let signature = sign_message(
            &self.credentials.api_secret,
            &format!("{}{}{}", nonce, path, body),
        )?;

        let header = |value: &str| {
            HeaderValue::from_str(value)
                .map_err(|e| ExchangeError::Auth(format!("invalid header value: {}", e)))
        };

        let mut headers = HeaderMap::new();
        headers.insert("X-API-KEY", header(&self.credentials.api_key)?);
        headers.insert("X-NONCE", header(&nonce.to_string())?);
        headers.insert("X-SIGNATURE", header(&signature)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn private_get<T: DeserializeOwned>(
        &self,
        nonce: CallIdentifier,
        path: &str,
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(exchange = %self.name, url = %url, nonce = %nonce, "GET");

        let resp = self
            .http
            .get(&url)
            .headers(self.private_headers(nonce, path, "")?)
            .send()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        Self::decode(resp).await
    }

    async fn private_post<B: Serialize, T: DeserializeOwned>(
        &self,
        nonce: CallIdentifier,
        path: &str,
        body: &B,
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let body = serde_json::to_string(body)
            .map_err(|e| ExchangeError::Rejected(format!("failed to encode request: {}", e)))?;
        debug!(exchange = %self.name, url = %url, nonce = %nonce, "POST");

        let resp = self
            .http
            .post(&url)
            .headers(self.private_headers(nonce, path, &body)?)
            .body(body)
            .send()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        Self::decode(resp).await
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ExchangeError> {
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let err = classify(status, &text);
            warn!(error = %err, "Exchange call failed");
            return Err(err);
        }

        // A body we cannot read leaves the outcome unknown.
        resp.json::<T>()
            .await
            .map_err(|e| ExchangeError::Network(format!("failed to decode response: {}", e)))
    }
}

#[async_trait]
impl Exchange for HttpExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_balance(&self, nonce: CallIdentifier) -> Result<Decimal, ExchangeError> {
        let resp: BalanceResponse = self.private_get(nonce, "/v1/balance").await?;
        Ok(resp.available)
    }

    async fn submit_order(
        &self,
        nonce: CallIdentifier,
        order: &OrderRequest,
    ) -> Result<FillConfirmation, ExchangeError> {
        let payload = OrderPayload {
            symbol: &order.symbol,
            side: order.side,
            size: order.size,
            size_type: order.size_type,
            order_type: "market",
        };

        let resp: OrderResponse = self.private_post(nonce, "/v1/orders", &payload).await?;
        Ok(resp.into())
    }

    async fn close_position(
        &self,
        nonce: CallIdentifier,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> Result<FillConfirmation, ExchangeError> {
        let payload = ClosePayload {
            symbol,
            side,
            quantity,
        };

        let resp: OrderResponse = self
            .private_post(nonce, "/v1/positions/close", &payload)
            .await?;
        Ok(resp.into())
    }

    async fn open_positions(
        &self,
        nonce: CallIdentifier,
    ) -> Result<Vec<HeldPosition>, ExchangeError> {
        self.private_get(nonce, "/v1/positions").await
    }
}

#[async_trait]
impl PriceFeed for HttpExchange {
    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let url = format!("{}/v1/ticker/{}", self.base_url, symbol);

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Stale(e.to_string()))?;

        let ticker: TickerResponse = Self::decode(resp).await?;
        Ok(ticker.price)
    }
}
