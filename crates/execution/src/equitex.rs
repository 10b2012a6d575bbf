// In crates/execution/src/equitex.rs

use app_config::types::EquitexSettings;
use async_trait::async_trait;
use core_types::{IntentKey, OrderStatus, Position, Side, Symbol};
use num_traits::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::rate_limit::TokenBucket;
use crate::types::{AccountState, OrderRequest, OrderResult, ProtectionSupport};
use crate::BrokerAdapter;

const BROKER_NAME: &str = "equitex";

/// An executor for the Equitex equities venue.
///
/// The venue uses bearer-token REST and trades in whole lots. It has no
/// server-side stop orders, so `set_protection` reports `Unsupported`
/// and positions here are always guarded by the synthetic watch.
pub struct EquitexClient {
    http_client: reqwest::Client,
    settings: EquitexSettings,
    bucket: TokenBucket,
}

#[derive(Deserialize)]
struct RawOrderState {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "clientOrderId", default)]
    client_order_id: Option<String>,
    #[serde(default)]
    ticker: String,
    #[serde(default)]
    direction: String,
    #[serde(rename = "lotsExecuted", default)]
    lots_executed: i64,
    #[serde(rename = "lotsRequested", default)]
    lots_requested: i64,
    #[serde(rename = "executedOrderPrice", default)]
    executed_order_price: String,
    #[serde(rename = "executionReportStatus", default)]
    status: String,
}

#[derive(Deserialize)]
struct RawHolding {
    ticker: String,
    #[serde(default)]
    balance: i64,
    #[serde(rename = "averagePositionPrice", default)]
    average_position_price: String,
    #[serde(rename = "expectedYield", default)]
    expected_yield: String,
}

impl EquitexClient {
    pub fn new(settings: &EquitexSettings) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            settings: settings.clone(),
            bucket: TokenBucket::new(settings.rate_per_sec, 5),
        }
    }

    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> Result<Value> {
        self.bucket.acquire().await;

        let url = format!("{}{}", self.settings.rest_base_url, path);
        let mut request = match method {
            "POST" => self.http_client.post(&url),
            _ => self.http_client.get(&url),
        };
        request = request.bearer_auth(&self.settings.token);
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
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| Error::Transient(format!("malformed response from {}: {}", path, e)))?;

        // Client errors come back as {"code": ..., "message": ...}.
        if status.is_client_error() {
            let code = value
                .get("code")
                .map(|c| c.to_string())
                .unwrap_or_else(|| status.as_u16().to_string());
            let reason = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request rejected")
                .to_string();
            return Err(Error::Rejected { code, reason });
        }

        Ok(value)
    }

    /// Equities trade in whole lots; anything fractional is rounded down.
    fn normalize_lots(qty: Decimal) -> i64 {
        qty.round_dp_with_strategy(0, RoundingStrategy::ToZero)
            .to_i64()
            .unwrap_or(0)
    }

    fn map_status(raw: &str) -> OrderStatus {
        match raw {
            "EXECUTION_REPORT_STATUS_FILL" => OrderStatus::Filled,
            "EXECUTION_REPORT_STATUS_CANCELLED" => OrderStatus::Cancelled,
            "EXECUTION_REPORT_STATUS_REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::Submitted,
        }
    }

    fn order_from_raw(&self, raw: RawOrderState) -> OrderResult {
        let side = if raw.direction == "ORDER_DIRECTION_SELL" {
            Side::Sell
        } else {
            Side::Buy
        };
        let quantity = Decimal::from(if raw.lots_executed > 0 {
            raw.lots_executed
        } else {
            raw.lots_requested
        });
        OrderResult {
            order_id: raw.order_id,
            client_key: raw.client_order_id,
            symbol: Symbol(raw.ticker),
            side,
            quantity,
            price: raw.executed_order_price.parse().unwrap_or_default(),
            status: Self::map_status(&raw.status),
            broker: BROKER_NAME.to_string(),
        }
    }
}

#[async_trait]
impl BrokerAdapter for EquitexClient {
    fn name(&self) -> &str {
        BROKER_NAME
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult> {
        let lots = Self::normalize_lots(order.quantity);
        if lots <= 0 {
            return Err(Error::Rejected {
                code: "lot-size".to_string(),
                reason: format!("{} rounds to zero lots", order.quantity),
            });
        }

        let direction = match order.side {
            Side::Buy => "ORDER_DIRECTION_BUY",
            Side::Sell => "ORDER_DIRECTION_SELL",
        };
        let mut body = json!({
            "ticker": order.symbol.0,
            "direction": direction,
            "quantity": lots,
            "orderType": if order.price.is_some() { "ORDER_TYPE_LIMIT" } else { "ORDER_TYPE_MARKET" },
        });
        if let Some(price) = order.price {
            body["price"] = json!(price.to_string());
        }
        if let Some(key) = &order.client_key {
            body["clientOrderId"] = json!(key.as_str());
        }

        tracing::info!(symbol = %order.symbol, side = order.side.as_str(), lots, "Placing order on equitex.");
        let value = self.request("POST", "/api/v2/orders", Some(body)).await?;
        let raw: RawOrderState = serde_json::from_value(value)
            .map_err(|e| Error::Transient(format!("malformed order payload: {}", e)))?;
        Ok(self.order_from_raw(raw))
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &Symbol) -> Result<()> {
        let body = json!({ "orderId": order_id });
        self.request("POST", "/api/v2/orders/cancel", Some(body)).await?;
        Ok(())
    }

    async fn balance(&self) -> Result<AccountState> {
        let value = self.request("GET", "/api/v2/portfolio", None).await?;
        let parse = |field: &str| -> Decimal {
            value
                .get(field)
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or_default()
        };
        Ok(AccountState {
            broker: BROKER_NAME.to_string(),
            equity: parse("totalAmountPortfolio"),
            balance: parse("totalAmountCurrencies"),
            currency: "RUB".to_string(),
        })
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        let value = self.request("GET", "/api/v2/portfolio/positions", None).await?;
        let raw: Vec<RawHolding> = serde_json::from_value(value)
            .map_err(|e| Error::Transient(format!("malformed positions payload: {}", e)))?;

        let mut out = Vec::with_capacity(raw.len());
        for holding in raw {
            if holding.balance == 0 {
                continue;
            }
            out.push(Position {
                symbol: Symbol(holding.ticker),
                broker: BROKER_NAME.to_string(),
                quantity: Decimal::from(holding.balance),
                avg_entry_price: holding.average_position_price.parse().unwrap_or_default(),
                unrealized_pnl: holding.expected_yield.parse().unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn open_orders(&self, symbol: Option<&Symbol>) -> Result<Vec<OrderResult>> {
        let value = self.request("GET", "/api/v2/orders", None).await?;
        let raw: Vec<RawOrderState> = serde_json::from_value(value)
            .map_err(|e| Error::Transient(format!("malformed orders payload: {}", e)))?;
        Ok(raw
            .into_iter()
            .map(|o| self.order_from_raw(o))
            .filter(|o| symbol.is_none_or(|s| &o.symbol == s))
            .collect())
    }

    async fn current_price(&self, symbol: &Symbol) -> Result<Decimal> {
        let path = format!("/api/v2/market/last-price?ticker={}", symbol.0);
        let value = self.request("GET", &path, None).await?;
        value
            .get("price")
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

    async fn set_protection(
        &self,
        _symbol: &Symbol,
        _quantity: Decimal,
        _stop_price: Option<Decimal>,
        _take_profit_price: Option<Decimal>,
        _stop_key: Option<&IntentKey>,
        _take_profit_key: Option<&IntentKey>,
    ) -> Result<ProtectionSupport> {
        // No server-side stops on this venue; the protections manager
        // falls back to the synthetic watch.
        Ok(ProtectionSupport::Unsupported)
    }

    async fn cancel_protection(&self, _order_id: &str, _symbol: &Symbol) -> Result<()> {
        Err(Error::Unsupported("cancel_protection"))
    }

    async fn order_status(
        &self,
        order_id: Option<&str>,
        client_key: Option<&IntentKey>,
        _symbol: &Symbol,
    ) -> Result<Option<OrderResult>> {
        let path = match (order_id, client_key) {
            (Some(id), _) => format!("/api/v2/orders/{}", id),
            (None, Some(key)) => format!("/api/v2/orders/by-client-id/{}", key.as_str()),
            (None, None) => return Ok(None),
        };
        match self.request("GET", &path, None).await {
            Ok(value) => {
                if value.is_null() {
                    return Ok(None);
                }
                let raw: RawOrderState = serde_json::from_value(value)
                    .map_err(|e| Error::Transient(format!("malformed order payload: {}", e)))?;
                Ok(Some(self.order_from_raw(raw)))
            }
            // An unknown order id is a clean "no record", not a failure.
            Err(Error::Rejected { code, .. }) if code.contains("404") => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn fractional_quantities_round_down_to_lots() {
        assert_eq!(EquitexClient::normalize_lots(dec!(3.7)), 3);
        assert_eq!(EquitexClient::normalize_lots(dec!(0.9)), 0);
        assert_eq!(EquitexClient::normalize_lots(dec!(12)), 12);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            EquitexClient::map_status("EXECUTION_REPORT_STATUS_FILL"),
            OrderStatus::Filled
        );
        assert_eq!(
            EquitexClient::map_status("EXECUTION_REPORT_STATUS_NEW"),
            OrderStatus::Submitted
        );
        assert_eq!(
            EquitexClient::map_status("EXECUTION_REPORT_STATUS_REJECTED"),
            OrderStatus::Rejected
        );
    }
}
