//! Kite Connect REST client for orders and portfolio.

use super::{
    Broker, OrderConfirmation, OrderRequest, Portfolio, Position, TradeError, EXCHANGE,
    ORDER_TYPE, PRODUCT, VALIDITY,
};
use crate::auth::KITE_API_VERSION;
use crate::credentials::CredentialRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct KiteBroker {
    client: Client,
    api_url: String,
    api_key: String,
}

/// Every Kite response is wrapped in this envelope
#[derive(Deserialize, Debug)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OrderData {
    order_id: String,
}

#[derive(Deserialize, Debug)]
struct PositionsData {
    #[serde(default)]
    net: Vec<KitePosition>,
}

#[derive(Deserialize, Debug)]
struct KitePosition {
    tradingsymbol: String,
    quantity: i64,
    #[serde(default)]
    last_price: f64,
}

impl From<KitePosition> for Position {
    fn from(p: KitePosition) -> Self {
        Position {
            symbol: p.tradingsymbol,
            quantity: p.quantity,
            last_price: p.last_price,
        }
    }
}

/// Map a Kite error envelope onto the trade error taxonomy
fn classify_error(error_type: Option<&str>, message: String) -> TradeError {
    match error_type {
        Some("TokenException") => TradeError::SessionRejected(message),
        Some("MarginException") => TradeError::InsufficientFunds(message),
        Some("InputException") if mentions_symbol(&message) => TradeError::InvalidSymbol(message),
        Some("NetworkException") => TradeError::Network(message),
        _ => TradeError::Rejected(message),
    }
}

fn mentions_symbol(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("tradingsymbol") || lower.contains("instrument")
}

fn transport_error(e: reqwest::Error) -> TradeError {
    if e.is_timeout() {
        TradeError::Timeout
    } else {
        TradeError::Network(e.to_string())
    }
}

impl KiteBroker {
    pub fn new(api_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn authorized(&self, request: RequestBuilder, session: &CredentialRecord) -> RequestBuilder {
        request
            .header("X-Kite-Version", KITE_API_VERSION)
            .header(
                "Authorization",
                format!("token {}:{}", self.api_key, session.access_token),
            )
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, TradeError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        let envelope: Envelope<T> = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(status = status.as_u16(), "Unparseable broker response: {}", e);
                return Err(TradeError::Rejected(format!(
                    "Unexpected broker response (HTTP {})",
                    status.as_u16()
                )));
            }
        };

        if !status.is_success() || envelope.status != "success" {
            let message = envelope
                .message
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(classify_error(envelope.error_type.as_deref(), message));
        }

        envelope
            .data
            .ok_or_else(|| TradeError::Rejected("Broker response had no data".to_string()))
    }
}

#[async_trait]
impl Broker for KiteBroker {
    async fn place_order(
        &self,
        session: &CredentialRecord,
        order: &OrderRequest,
    ) -> Result<OrderConfirmation, TradeError> {
        let quantity = order.quantity.to_string();
        let form = [
            ("tradingsymbol", order.symbol.as_str()),
            ("exchange", EXCHANGE),
            ("transaction_type", order.side.as_str()),
            ("quantity", quantity.as_str()),
            ("product", PRODUCT),
            ("order_type", ORDER_TYPE),
            ("validity", VALIDITY),
        ];

        debug!(symbol = %order.symbol, side = %order.side, quantity = order.quantity, "Placing order");

        let request = self
            .authorized(self.client.post(format!("{}/orders/regular", self.api_url)), session)
            .form(&form);
        let data: OrderData = self.call(request).await?;

        info!(order_id = %data.order_id, symbol = %order.symbol, side = %order.side, "Order placed");
        Ok(OrderConfirmation {
            order_id: data.order_id,
        })
    }

    async fn portfolio(&self, session: &CredentialRecord) -> Result<Portfolio, TradeError> {
        let positions: PositionsData = self
            .call(self.authorized(
                self.client.get(format!("{}/portfolio/positions", self.api_url)),
                session,
            ))
            .await?;
        let holdings: Vec<KitePosition> = self
            .call(self.authorized(
                self.client.get(format!("{}/portfolio/holdings", self.api_url)),
                session,
            ))
            .await?;

        Ok(Portfolio {
            positions: positions.net.into_iter().map(Position::from).collect(),
            holdings: holdings.into_iter().map(Position::from).collect(),
        })
    }
}
