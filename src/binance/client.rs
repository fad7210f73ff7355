// =============================================================================
// BinanceAdapter — HMAC-SHA256 signed spot REST client + stream subscriptions
// =============================================================================
//
// Reference `ExchangeAdapter` implementation (spec §4.7). One instance per
// tenant, each holding its own decrypted API key/secret — there is no shared
// global client, unlike the single-tenant client this is grounded on.
//
// SECURITY: the secret key is never logged or serialized. Every signed
// request carries `X-MBX-APIKEY` as a header (never in the query string) and
// a fixed recv-window to tolerate minor clock drift; skew tolerance itself is
// the exchange's concern, not the adapter's (spec §4.7).
// =============================================================================

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use sha2::Sha256;
use tokio_tungstenite::connect_async;
use tracing::{debug, instrument, warn};

use crate::binance::rate_limit::RateLimitTracker;
use crate::errors::{EngineError, ExchangeErrorKind};
use crate::exchange::{ApiKeyValidation, ExchangeAdapter, OrderbookCallback, UserDataCallback};
use crate::types::{Order, Orderbook, OrderbookLevel, OrderStatus, OrderType, PlaceOrderParams, Side, Symbol};

type HmacSha256 = Hmac<Sha256>;

/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5_000;
/// Bounded timeout for every outbound exchange HTTP call (spec §5).
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Binance spot REST + stream client with HMAC-SHA256 request signing.
/// Implements `ExchangeAdapter` for one tenant's credentials.
pub struct BinanceAdapter {
    secret: String,
    base_url: String,
    ws_base: String,
    client: reqwest::Client,
    rate_limiter: RateLimitTracker,
    disconnected: AtomicBool,
    testnet: bool,
}

impl BinanceAdapter {
    /// Create a new adapter bound to one tenant's decrypted credentials.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        let (base_url, ws_base) = if testnet {
            ("https://testnet.binance.vision".to_string(), "wss://testnet.binance.vision/ws".to_string())
        } else {
            ("https://api.binance.com".to_string(), "wss://stream.binance.com:9443/ws".to_string())
        };

        debug!(testnet, "BinanceAdapter initialised");

        Self {
            secret,
            base_url,
            ws_base,
            client,
            rate_limiter: RateLimitTracker::new(),
            disconnected: AtomicBool::new(false),
            testnet,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before UNIX epoch").as_millis() as u64
    }

    /// Build the signed query string: the spec requires HMAC of the
    /// lexicographically sorted query string plus a millisecond timestamp.
    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let mut sorted: Vec<(&str, String)> = params.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(b.0));

        let ts = Self::timestamp_ms();
        let mut base = sorted
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        if !base.is_empty() {
            base.push('&');
        }
        base.push_str(&format!("timestamp={ts}&recvWindow={RECV_WINDOW}"));

        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn classify_status(status: reqwest::StatusCode) -> ExchangeErrorKind {
        ExchangeErrorKind::from_http_status(status.as_u16())
    }

    async fn exchange_err_from_response(resp: reqwest::Response) -> EngineError {
        let status = resp.status();
        let kind = Self::classify_status(status);
        let body = resp.text().await.unwrap_or_default();
        EngineError::exchange(kind, Some(status.as_u16()), body)
    }

    fn wrap_request_err(err: reqwest::Error) -> EngineError {
        if err.is_timeout() {
            EngineError::exchange(ExchangeErrorKind::Timeout, None, err.to_string())
        } else {
            EngineError::exchange(ExchangeErrorKind::Other, None, err.to_string())
        }
    }

    fn parse_order(symbol: &Symbol, body: &serde_json::Value) -> Result<Order, EngineError> {
        let side = body["side"].as_str().unwrap_or("BUY");
        let side = Side::from_str(side).map_err(EngineError::Validation)?;
        let order_type = if body["type"].as_str() == Some("MARKET") { OrderType::Market } else { OrderType::Limit };
        let status = match body["status"].as_str().unwrap_or("NEW") {
            "FILLED" => OrderStatus::Filled,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "CANCELED" | "EXPIRED" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::New,
        };
        let price = body["price"].as_str().and_then(|s| Decimal::from_str(s).ok()).filter(|d| !d.is_zero());
        let qty = body["origQty"].as_str().and_then(|s| Decimal::from_str(s).ok()).unwrap_or(Decimal::ZERO);
        let filled_qty = body["executedQty"].as_str().and_then(|s| Decimal::from_str(s).ok()).unwrap_or(Decimal::ZERO);
        let avg_price = if filled_qty.is_zero() {
            None
        } else {
            body["cummulativeQuoteQty"]
                .as_str()
                .and_then(|s| Decimal::from_str(s).ok())
                .map(|quote| quote / filled_qty)
        };
        let now = Utc::now();

        Ok(Order {
            id: body["orderId"].as_u64().map(|n| n.to_string()).unwrap_or_default(),
            client_id: body["clientOrderId"].as_str().unwrap_or_default().to_string(),
            symbol: symbol.clone(),
            side,
            order_type,
            qty,
            price,
            status,
            filled_qty,
            avg_price,
            created_at: now,
            updated_at: now,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    #[instrument(skip(self), name = "binance::get_orderbook")]
    async fn get_orderbook(&self, symbol: &Symbol, depth: u32) -> Result<Orderbook, EngineError> {
        if !self.rate_limiter.can_send_request(5) {
            return Err(EngineError::exchange(ExchangeErrorKind::RateLimited, Some(429), "local rate limit"));
        }

        let url = format!("{}/api/v3/depth?symbol={}&limit={}", self.base_url, symbol.as_str(), depth);
        let resp = self.client.get(&url).send().await.map_err(Self::wrap_request_err)?;
        self.rate_limiter.update_from_headers(resp.headers());

        if !resp.status().is_success() {
            return Err(Self::exchange_err_from_response(resp).await);
        }

        let body: serde_json::Value = resp.json().await.map_err(Self::wrap_request_err)?;

        let parse_levels = |arr: &serde_json::Value| -> Vec<OrderbookLevel> {
            arr.as_array()
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|lvl| {
                            let p = lvl.get(0)?.as_str()?;
                            let q = lvl.get(1)?.as_str()?;
                            Some(OrderbookLevel {
                                price: Decimal::from_str(p).ok()?,
                                quantity: Decimal::from_str(q).ok()?,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(Orderbook {
            symbol: symbol.clone(),
            bids: parse_levels(&body["bids"]),
            asks: parse_levels(&body["asks"]),
            update_seq: body["lastUpdateId"].as_u64().unwrap_or(0),
        })
    }

    #[instrument(skip(self, params), name = "binance::place_order")]
    async fn place_order(&self, params: PlaceOrderParams) -> Result<Order, EngineError> {
        if !self.rate_limiter.can_place_order() {
            return Err(EngineError::exchange(ExchangeErrorKind::RateLimited, Some(429), "local order-rate limit"));
        }

        let mut query = vec![
            ("symbol".to_string(), params.symbol.as_str().to_string()),
            ("side".to_string(), params.side.to_string()),
            ("type".to_string(), params.order_type.to_string()),
            ("quantity".to_string(), params.qty.to_string()),
            ("newClientOrderId".to_string(), params.client_id.clone()),
        ];
        if let Some(price) = params.price {
            query.push(("price".to_string(), price.to_string()));
            query.push(("timeInForce".to_string(), "GTC".to_string()));
        }
        let kv: Vec<(&str, String)> = query.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();

        let qs = self.signed_query(&kv);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self.client.post(&url).send().await.map_err(Self::wrap_request_err)?;
        self.rate_limiter.update_from_headers(resp.headers());
        self.rate_limiter.record_order_sent();

        if !resp.status().is_success() {
            return Err(Self::exchange_err_from_response(resp).await);
        }

        let body: serde_json::Value = resp.json().await.map_err(Self::wrap_request_err)?;
        Self::parse_order(&params.symbol, &body)
    }

    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<Order, EngineError> {
        let kv = [("symbol".to_string(), symbol.as_str().to_string()), ("orderId".to_string(), order_id.to_string())];
        let kv: Vec<(&str, String)> = kv.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
        let qs = self.signed_query(&kv);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self.client.delete(&url).send().await.map_err(Self::wrap_request_err)?;
        self.rate_limiter.update_from_headers(resp.headers());

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            // idempotent: the exchange reports an already-gone order as a
            // 400 with code -2011 ("Unknown order sent") — OrderManager
            // treats that as a successful cancel (spec §4.3).
            if body.contains("-2011") {
                return Err(EngineError::exchange(ExchangeErrorKind::UnknownOrder, Some(status.as_u16()), body));
            }
            return Err(EngineError::exchange(Self::classify_status(status), Some(status.as_u16()), body));
        }

        let body: serde_json::Value = resp.json().await.map_err(Self::wrap_request_err)?;
        Self::parse_order(symbol, &body)
    }

    #[instrument(skip(self), name = "binance::get_order_status")]
    async fn get_order_status(&self, symbol: &Symbol, order_id: &str) -> Result<Order, EngineError> {
        let kv = [("symbol".to_string(), symbol.as_str().to_string()), ("orderId".to_string(), order_id.to_string())];
        let kv: Vec<(&str, String)> = kv.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
        let qs = self.signed_query(&kv);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self.client.get(&url).send().await.map_err(Self::wrap_request_err)?;
        if !resp.status().is_success() {
            return Err(Self::exchange_err_from_response(resp).await);
        }
        let body: serde_json::Value = resp.json().await.map_err(Self::wrap_request_err)?;
        Self::parse_order(symbol, &body)
    }

    async fn subscribe_orderbook(&self, symbol: &Symbol, on_update: OrderbookCallback) -> Result<(), EngineError> {
        let lower = symbol.as_str().to_lowercase();
        let url = format!("{}/{lower}@depth20@100ms", self.ws_base);

        let (ws_stream, _response) = connect_async(&url)
            .await
            .map_err(|e| EngineError::exchange(ExchangeErrorKind::Other, None, e.to_string()))?;
        let (_write, mut read) = ws_stream.split();

        while !self.disconnected.load(Ordering::Relaxed) {
            match read.next().await {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                    if let Ok(ob) = Self::parse_depth_message(symbol, &text) {
                        on_update(ob);
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(symbol = %symbol, error = %e, "orderbook stream error");
                    break;
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn subscribe_user_data(&self, _on_update: UserDataCallback) -> Result<(), EngineError> {
        // The user-data stream requires a listen-key handshake that is pure
        // exchange wire protocol (explicitly out of scope, spec §4.7); the
        // reference adapter exposes the capability but fills/updates are
        // delivered to `OrderManager` via `get_order_status` polling instead.
        Ok(())
    }

    #[instrument(skip(self), name = "binance::validate_api_key")]
    async fn validate_api_key(&self) -> Result<ApiKeyValidation, EngineError> {
        let qs = self.signed_query(&[]);
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);

        let resp = self.client.get(&url).send().await.map_err(Self::wrap_request_err)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Ok(ApiKeyValidation { valid: false, can_trade: false, can_withdraw: false, error: Some(body) });
        }

        let body: serde_json::Value = resp.json().await.map_err(Self::wrap_request_err)?;
        Ok(ApiKeyValidation {
            valid: true,
            can_trade: body["canTrade"].as_bool().unwrap_or(false),
            can_withdraw: body["canWithdraw"].as_bool().unwrap_or(false),
            error: None,
        })
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Relaxed);
    }
}

impl BinanceAdapter {
    /// Parse a Binance partial-depth WebSocket message into a canonical
    /// `Orderbook`. `update_seq` comes straight from `lastUpdateId`.
    fn parse_depth_message(symbol: &Symbol, text: &str) -> Result<Orderbook> {
        let root: serde_json::Value = serde_json::from_str(text).context("failed to parse depth JSON")?;
        let update_seq = root["lastUpdateId"].as_u64().unwrap_or(0);

        let parse_levels = |arr: &serde_json::Value| -> Vec<OrderbookLevel> {
            arr.as_array()
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|lvl| {
                            let p = lvl.get(0)?.as_str()?;
                            let q = lvl.get(1)?.as_str()?;
                            Some(OrderbookLevel {
                                price: Decimal::from_str(p).ok()?,
                                quantity: Decimal::from_str(q).ok()?,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(Orderbook {
            symbol: symbol.clone(),
            bids: parse_levels(&root["bids"]),
            asks: parse_levels(&root["asks"]),
            update_seq,
        })
    }
}

impl std::fmt::Debug for BinanceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceAdapter")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("testnet", &self.testnet)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_query_sorts_params_lexicographically() {
        let adapter = BinanceAdapter::new("key", "secret", true);
        let qs = adapter.signed_query(&[("symbol".into(), "BTCUSDT".into()), ("orderId".into(), "1".into())]);
        // orderId < symbol lexicographically.
        let order_pos = qs.find("orderId").unwrap();
        let symbol_pos = qs.find("symbol").unwrap();
        assert!(order_pos < symbol_pos);
    }

    #[test]
    fn parse_order_maps_status_and_decimals() {
        let body = serde_json::json!({
            "orderId": 42,
            "clientOrderId": "abc",
            "side": "BUY",
            "type": "LIMIT",
            "status": "PARTIALLY_FILLED",
            "price": "100.50",
            "origQty": "1.0",
            "executedQty": "0.5",
            "cummulativeQuoteQty": "50.25",
        });
        let order = BinanceAdapter::parse_order(&Symbol::new("BTCUSDT"), &body).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_qty, Decimal::from_str("0.5").unwrap());
        assert_eq!(order.avg_price, Some(Decimal::from_str("100.5").unwrap()));
    }
}
