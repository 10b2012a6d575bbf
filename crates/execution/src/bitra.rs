// In crates/execution/src/bitra.rs

use app_config::types::BitraSettings;
use async_trait::async_trait;
use chrono::Utc;
use core_types::{IntentKey, OrderStatus, Position, Side, Symbol};
use hmac::{Hmac, Mac};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::rate_limit::TokenBucket;
use crate::types::{AccountState, OrderRequest, OrderResult, ProtectionSupport};
use crate::BrokerAdapter;

// Create a type alias for the HMAC-SHA256 implementation.
type HmacSha256 = Hmac<Sha256>;

const BROKER_NAME: &str = "bitra";

/// Venue API codes that indicate a transient condition worth retrying
/// next cycle rather than a terminal rejection.
const RETRYABLE_CODES: &[&str] = &["30001", "30007", "40725", "45110"];

/// The venue's default quantity step for USDT-margined futures.
const QTY_PRECISION: u32 = 4;

/// An executor for the Bitra crypto-futures venue.
///
/// All private endpoints are signed with HMAC-SHA256 over
/// `timestamp + method + path + body`. Protective stops are placed as
/// native "plan" (trigger) orders, so `set_protection` reports
/// [`ProtectionSupport::Native`].
pub struct BitraClient {
    http_client: reqwest::Client,
    settings: BitraSettings,
    bucket: TokenBucket,
}

#[derive(Deserialize)]
struct Envelope {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct RawOrder {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "clientOid", default)]
    client_oid: Option<String>,
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    size: String,
    #[serde(rename = "priceAvg", default)]
    price_avg: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct RawPosition {
    symbol: String,
    #[serde(rename = "holdSide")]
    hold_side: String,
    total: String,
    #[serde(rename = "averageOpenPrice", default)]
    average_open_price: String,
    #[serde(rename = "unrealizedPL", default)]
    unrealized_pl: String,
}

impl BitraClient {
    pub fn new(settings: &BitraSettings) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            settings: settings.clone(),
            bucket: TokenBucket::new(settings.rate_per_sec, 10),
        }
    }

    /// Generates an HMAC-SHA256 signature for a prehash string.
    fn sign(&self, prehash: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.settings.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(prehash.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Performs one signed request and unwraps the venue envelope.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> Result<Value> {
        self.bucket.acquire().await;

        let timestamp = Utc::now().timestamp_millis().to_string();
        let body_str = body
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default();
        let prehash = format!("{}{}{}{}", timestamp, method, path, body_str);
        let signature = self.sign(&prehash);

        let url = format!("{}{}", self.settings.rest_base_url, path);
        let mut request = match method {
            "POST" => self.http_client.post(&url),
            _ => self.http_client.get(&url),
        };
        request = request
            .header("BX-ACCESS-KEY", &self.settings.api_key)
            .header("BX-ACCESS-SIGN", signature)
            .header("BX-ACCESS-TIMESTAMP", timestamp)
            .header("BX-ACCESS-PASSPHRASE", &self.settings.passphrase);
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::from_http(BROKER_NAME, e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Auth {
                broker: BROKER_NAME.to_string(),
                reason: format!("HTTP {}", status),
            });
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(Error::Transient(format!("HTTP {} from {}", status, path)));
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::from_http(BROKER_NAME, e))?;
        let envelope: Envelope = serde_json::from_str(&text)
            .map_err(|e| Error::Transient(format!("malformed response from {}: {}", path, e)))?;

        if envelope.code != "00000" {
            if RETRYABLE_CODES.contains(&envelope.code.as_str()) {
                return Err(Error::Transient(format!(
                    "venue busy: code {}, {}",
                    envelope.code, envelope.msg
                )));
            }
            return Err(Error::Rejected {
                code: envelope.code,
                reason: envelope.msg,
            });
        }

        Ok(envelope.data)
    }

    /// Rounds a quantity down to the venue's step so an order is never
    /// rejected for over-precision.
    fn normalize_qty(qty: Decimal) -> Decimal {
        qty.round_dp_with_strategy(QTY_PRECISION, RoundingStrategy::ToZero)
    }

    fn map_status(raw: &str) -> OrderStatus {
        match raw {
            "filled" => OrderStatus::Filled,
            "cancelled" | "canceled" => OrderStatus::Cancelled,
            "rejected" => OrderStatus::Rejected,
            // live / new / partially_filled and anything unknown stay open.
            _ => OrderStatus::Submitted,
        }
    }

    fn order_from_raw(&self, raw: RawOrder) -> OrderResult {
        let side = if raw.side.eq_ignore_ascii_case("sell") {
            Side::Sell
        } else {
            Side::Buy
        };
        OrderResult {
            order_id: raw.order_id,
            client_key: raw.client_oid,
            symbol: Symbol(raw.symbol),
            side,
            quantity: raw.size.parse().unwrap_or_default(),
            price: raw.price_avg.parse().unwrap_or_default(),
            status: Self::map_status(&raw.status),
            broker: BROKER_NAME.to_string(),
        }
    }

    async fn place_plan_leg(
        &self,
        symbol: &Symbol,
        plan_type: &str,
        trigger_price: Decimal,
        quantity: Decimal,
        client_key: Option<&IntentKey>,
    ) -> Result<String> {
        let mut body = json!({
            "symbol": symbol.0,
            "planType": plan_type,
            "triggerPrice": trigger_price.to_string(),
            "size": Self::normalize_qty(quantity).to_string(),
        });
        if let Some(key) = client_key {
            body["clientOid"] = json!(key.as_str());
        }
        let data = self.request("POST", "/api/v1/plan/place-tpsl", Some(body)).await?;
        let order_id = data
            .get("orderId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if order_id.is_empty() {
            // An empty id means the protection did not actually arm.
            return Err(Error::Rejected {
                code: "empty-plan-id".to_string(),
                reason: format!("{} placement returned no order id", plan_type),
            });
        }
        Ok(order_id)
    }
}

#[async_trait]
impl BrokerAdapter for BitraClient {
    fn name(&self) -> &str {
        BROKER_NAME
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult> {
        let mut body = json!({
            "symbol": order.symbol.0,
            "side": order.side.as_str(),
            "orderType": if order.price.is_some() { "limit" } else { "market" },
            "size": Self::normalize_qty(order.quantity).to_string(),
        });
        if let Some(price) = order.price {
            body["price"] = json!(price.to_string());
        }
        if let Some(key) = &order.client_key {
            body["clientOid"] = json!(key.as_str());
        }

        tracing::info!(symbol = %order.symbol, side = order.side.as_str(), qty = %order.quantity, "Placing order on bitra.");
        let data = self.request("POST", "/api/v1/trade/place-order", Some(body)).await?;

        let order_id = data
            .get("orderId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // The placement response carries no fill data; the router's
        // confirmation loop polls `order_status` until a final status.
        Ok(OrderResult {
            order_id,
            client_key: order.client_key.as_ref().map(|k| k.as_str().to_string()),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price: Decimal::ZERO,
            status: OrderStatus::Submitted,
            broker: BROKER_NAME.to_string(),
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> Result<()> {
        let body = json!({ "symbol": symbol.0, "orderId": order_id });
        self.request("POST", "/api/v1/trade/cancel-order", Some(body)).await?;
        Ok(())
    }

    async fn balance(&self) -> Result<AccountState> {
        let data = self.request("GET", "/api/v1/account/account?marginCoin=USDT", None).await?;
        let equity: Decimal = data
            .get("equity")
            .and_then(Value::as_str)
            .unwrap_or("0")
            .parse()
            .unwrap_or_default();
        let balance: Decimal = data
            .get("available")
            .and_then(Value::as_str)
            .unwrap_or("0")
            .parse()
            .unwrap_or_default();
        Ok(AccountState {
            broker: BROKER_NAME.to_string(),
            equity,
            balance,
            currency: "USDT".to_string(),
        })
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        let data = self.request("GET", "/api/v1/position/all-positions", None).await?;
        let raw: Vec<RawPosition> = serde_json::from_value(data)
            .map_err(|e| Error::Transient(format!("malformed positions payload: {}", e)))?;

        let mut out = Vec::with_capacity(raw.len());
        for p in raw {
            let qty: Decimal = p.total.parse().unwrap_or_default();
            if qty.is_zero() {
                continue;
            }
            let signed = if p.hold_side.eq_ignore_ascii_case("short") { -qty } else { qty };
            out.push(Position {
                symbol: Symbol(p.symbol),
                broker: BROKER_NAME.to_string(),
                quantity: signed,
                avg_entry_price: p.average_open_price.parse().unwrap_or_default(),
                unrealized_pnl: p.unrealized_pl.parse().unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn open_orders(&self, symbol: Option<&Symbol>) -> Result<Vec<OrderResult>> {
        let path = match symbol {
            Some(s) => format!("/api/v1/trade/unfilled-orders?symbol={}", s.0),
            None => "/api/v1/trade/unfilled-orders".to_string(),
        };
        let data = self.request("GET", &path, None).await?;
        let raw: Vec<RawOrder> = serde_json::from_value(data)
            .map_err(|e| Error::Transient(format!("malformed open-orders payload: {}", e)))?;
        Ok(raw.into_iter().map(|o| self.order_from_raw(o)).collect())
    }

    async fn current_price(&self, symbol: &Symbol) -> Result<Decimal> {
        let path = format!("/api/v1/market/ticker?symbol={}", symbol.0);
        let data = self.request("GET", &path, None).await?;
        data.get("lastPr")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Transient(format!("no last price for {}", symbol)))
    }

    async fn close_position(&self, symbol: &Symbol) -> Result<Option<OrderResult>> {
        let positions = self.positions().await?;
        let Some(position) = positions.into_iter().find(|p| &p.symbol == symbol) else {
            return Ok(None);
        };
        if !position.is_open() {
            return Ok(None);
        }

        let order = OrderRequest {
            symbol: symbol.clone(),
            side: position.closing_side(),
            quantity: position.quantity.abs(),
            price: None,
            client_key: None,
        };
        self.place_order(&order).await.map(Some)
    }

    fn supports_protections(&self) -> bool {
        true
    }

    async fn set_protection(
        &self,
        symbol: &Symbol,
        quantity: Decimal,
        stop_price: Option<Decimal>,
        take_profit_price: Option<Decimal>,
        stop_key: Option<&IntentKey>,
        take_profit_key: Option<&IntentKey>,
    ) -> Result<ProtectionSupport> {
        let mut stop_order_id = None;
        if let Some(stop) = stop_price {
            stop_order_id = Some(
                self.place_plan_leg(symbol, "loss_plan", stop, quantity, stop_key)
                    .await?,
            );
        }

        let mut take_profit_order_id = None;
        if let Some(tp) = take_profit_price {
            match self
                .place_plan_leg(symbol, "profit_plan", tp, quantity, take_profit_key)
                .await
            {
                Ok(id) => take_profit_order_id = Some(id),
                Err(e) => {
                    // Never leave a lone half-armed pair behind.
                    if let Some(sl_id) = &stop_order_id {
                        if let Err(cancel_err) = self.cancel_protection(sl_id, symbol).await {
                            tracing::warn!(symbol = %symbol, error = %cancel_err, "Failed to roll back stop leg after TP failure.");
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(ProtectionSupport::Native {
            stop_order_id,
            take_profit_order_id,
        })
    }

    async fn cancel_protection(&self, order_id: &str, symbol: &Symbol) -> Result<()> {
        let body = json!({ "symbol": symbol.0, "orderId": order_id });
        self.request("POST", "/api/v1/plan/cancel-plan", Some(body)).await?;
        Ok(())
    }

    async fn order_status(
        &self,
        order_id: Option<&str>,
        client_key: Option<&IntentKey>,
        symbol: &Symbol,
    ) -> Result<Option<OrderResult>> {
        let mut path = format!("/api/v1/trade/order-info?symbol={}", symbol.0);
        if let Some(id) = order_id {
            path.push_str(&format!("&orderId={}", id));
        } else if let Some(key) = client_key {
            path.push_str(&format!("&clientOid={}", key.as_str()));
        } else {
            return Ok(None);
        }

        let data = self.request("GET", &path, None).await?;
        if data.is_null() {
            return Ok(None);
        }
        let raw: RawOrder = serde_json::from_value(data)
            .map_err(|e| Error::Transient(format!("malformed order-info payload: {}", e)))?;
        Ok(Some(self.order_from_raw(raw)))
    }
}
