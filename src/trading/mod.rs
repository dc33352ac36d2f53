//! Trading collaborator.
//!
//! The dispatcher only talks to a [`Broker`]; [`KiteBroker`] is the HTTP
//! implementation against the Kite Connect REST API. Orders are always
//! market / delivery (CNC) / NSE / DAY.

mod kite;
mod order_log;

pub use kite::KiteBroker;
pub use order_log::{OrderLog, OrderLogOutcome};

use crate::credentials::CredentialRecord;
use async_trait::async_trait;
use serde::Serialize;

pub const EXCHANGE: &str = "NSE";
pub const PRODUCT: &str = "CNC";
pub const ORDER_TYPE: &str = "MARKET";
pub const VALIDITY: &str = "DAY";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated market order
#[derive(Clone, Debug, PartialEq)]
pub struct OrderRequest {
    /// Upper-case trading symbol, e.g. `RELIANCE`
    pub symbol: String,
    pub quantity: u32,
    pub side: Side,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderConfirmation {
    pub order_id: String,
}

/// One line of the portfolio view
#[derive(Clone, Debug, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub quantity: i64,
    pub last_price: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Portfolio {
    /// Net positions for the day
    pub positions: Vec<Position>,
    /// Delivery holdings
    pub holdings: Vec<Position>,
}

impl Portfolio {
    /// Human-readable listing, one `stock: X, qty: N, currentPrice: P` line per entry.
    pub fn summary(&self) -> String {
        if self.positions.is_empty() && self.holdings.is_empty() {
            return "No positions found.".to_string();
        }

        let line = |p: &Position| {
            format!("stock: {}, qty: {}, currentPrice: {}", p.symbol, p.quantity, p.last_price)
        };

        let mut sections = Vec::new();
        if !self.positions.is_empty() {
            let lines: Vec<String> = self.positions.iter().map(line).collect();
            sections.push(format!("Positions:\n{}", lines.join("\n")));
        }
        if !self.holdings.is_empty() {
            let lines: Vec<String> = self.holdings.iter().map(line).collect();
            sections.push(format!("Holdings:\n{}", lines.join("\n")));
        }
        sections.join("\n\n")
    }
}

/// Broker-side failures of a privileged call. Never retried.
#[derive(Clone, Debug, PartialEq)]
pub enum TradeError {
    InsufficientFunds(String),
    InvalidSymbol(String),
    /// Broker refused the order for any other reason
    Rejected(String),
    /// Broker no longer accepts the stored access token
    SessionRejected(String),
    Timeout,
    Network(String),
}

impl TradeError {
    /// Stable machine-readable name
    pub fn kind(&self) -> &'static str {
        match self {
            TradeError::InsufficientFunds(_) => "insufficient_funds",
            TradeError::InvalidSymbol(_) => "invalid_symbol",
            TradeError::Rejected(_) => "rejected",
            TradeError::SessionRejected(_) => "session_rejected",
            TradeError::Timeout => "timeout",
            TradeError::Network(_) => "network",
        }
    }

    /// Whether the broker answered (as opposed to never being reached)
    pub fn is_broker_answer(&self) -> bool {
        !matches!(self, TradeError::Timeout | TradeError::Network(_))
    }
}

impl std::fmt::Display for TradeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeError::InsufficientFunds(msg) => write!(f, "Insufficient funds: {}", msg),
            TradeError::InvalidSymbol(msg) => write!(f, "Invalid symbol: {}", msg),
            TradeError::Rejected(msg) => write!(f, "Order rejected: {}", msg),
            TradeError::SessionRejected(msg) => write!(f, "Broker rejected session: {}", msg),
            TradeError::Timeout => write!(f, "Broker did not respond in time"),
            TradeError::Network(msg) => write!(f, "Network error: {}", msg),
        }
    }
}

impl std::error::Error for TradeError {}

/// Privileged broker operations. Callers run the session guard first.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn place_order(
        &self,
        session: &CredentialRecord,
        order: &OrderRequest,
    ) -> Result<OrderConfirmation, TradeError>;

    async fn portfolio(&self, session: &CredentialRecord) -> Result<Portfolio, TradeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_portfolio_summary_empty() {
        assert_eq!(Portfolio::default().summary(), "No positions found.");
    }

    #[test]
    fn test_portfolio_summary_lines() {
        let portfolio = Portfolio {
            positions: vec![Position {
                symbol: "RELIANCE".to_string(),
                quantity: 10,
                last_price: 2450.5,
            }],
            holdings: vec![Position {
                symbol: "TCS".to_string(),
                quantity: 3,
                last_price: 3900.0,
            }],
        };

        let summary = portfolio.summary();
        assert!(summary.contains("stock: RELIANCE, qty: 10, currentPrice: 2450.5"));
        assert!(summary.contains("stock: TCS, qty: 3, currentPrice: 3900"));
    }

    #[test]
    fn test_trade_error_kinds() {
        assert_eq!(TradeError::Timeout.kind(), "timeout");
        assert!(!TradeError::Network("down".into()).is_broker_answer());
        assert!(TradeError::InsufficientFunds("margin".into()).is_broker_answer());
        assert_eq!(Side::Sell.to_string(), "SELL");
    }
}
