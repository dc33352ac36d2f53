//! Tool dispatcher.
//!
//! Receives named tool calls from the MCP endpoint and maps every outcome onto
//! a [`ToolResult`]. Privileged tools go through three gates in order:
//!
//! 1. Argument validation (`validation_error`)
//! 2. Session guard (`auth_required`, broker never called)
//! 3. Broker call (`trade_error` on failure, never retried)

mod validation;


pub use validation::{normalize_symbol, parse_order, parse_quantity, ValidationError};

use crate::auth::build_login_url;
use crate::config::KiteConfig;
use crate::credentials::{CredentialRecord, TokenStore};
use crate::guard::{Directive, ReauthReason, SessionGuard, SessionState};
use crate::trading::{Broker, OrderLog, OrderLogOutcome, OrderRequest, Side, TradeError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Every tool the dispatcher exposes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tool {
    CheckAuthenticationStatus,
    GetKiteLoginUrl,
    BuyStock,
    SellStock,
    ShowPortfolio,
    ServerHealthCheck,
}

impl Tool {
    pub const ALL: [Tool; 6] = [
        Tool::CheckAuthenticationStatus,
        Tool::GetKiteLoginUrl,
        Tool::BuyStock,
        Tool::SellStock,
        Tool::ShowPortfolio,
        Tool::ServerHealthCheck,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Tool::CheckAuthenticationStatus => "check_authentication_status",
            Tool::GetKiteLoginUrl => "get_kite_login_url",
            Tool::BuyStock => "buy_stock",
            Tool::SellStock => "sell_stock",
            Tool::ShowPortfolio => "show_portfolio",
            Tool::ServerHealthCheck => "server_health_check",
        }
    }

    pub fn from_name(name: &str) -> Option<Tool> {
        Tool::ALL.into_iter().find(|tool| tool.name() == name)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Tool::CheckAuthenticationStatus => "Check whether a valid Kite session is stored",
            Tool::GetKiteLoginUrl => "Get the Kite Connect login URL to start a new session",
            Tool::BuyStock => "Buy shares with a market order (NSE, delivery)",
            Tool::SellStock => "Sell shares with a market order (NSE, delivery)",
            Tool::ShowPortfolio => "Show current portfolio positions and holdings",
            Tool::ServerHealthCheck => "Report server health and session state",
        }
    }

    pub fn input_schema(&self) -> Value {
        match self {
            Tool::BuyStock | Tool::SellStock => json!({
                "type": "object",
                "properties": {
                    "stock": { "type": "string", "description": "NSE trading symbol, e.g. RELIANCE" },
                    "qty": { "type": "integer", "minimum": 1, "description": "Number of shares" }
                },
                "required": ["stock", "qty"]
            }),
            _ => json!({ "type": "object", "properties": {} }),
        }
    }

    /// Requires a valid broker session
    pub fn is_privileged(&self) -> bool {
        matches!(self, Tool::BuyStock | Tool::SellStock | Tool::ShowPortfolio)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Ok,
    ValidationError,
    AuthRequired,
    TradeError,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrderSummary {
    pub order_id: String,
    pub symbol: String,
    pub quantity: u32,
    pub side: Side,
}

/// Re-authentication directive as seen by the agent
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuthRequired {
    #[serde(flatten)]
    pub reason: ReauthReason,
    pub login_url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionInfo {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&SessionState> for SessionInfo {
    fn from(state: &SessionState) -> Self {
        let record = state.record();
        SessionInfo {
            state: state.label().to_string(),
            user_id: record.and_then(|r| r.user_id.clone()),
            issued_at: record.map(|r| r.issued_at),
            expires_at: record.map(|r| r.expires_at),
        }
    }
}

/// Uniform response contract for every tool call
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub kind: ResultKind,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthRequired>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_url: Option<String>,
}

impl ToolResult {
    pub fn ok(summary: String) -> Self {
        Self {
            success: true,
            kind: ResultKind::Ok,
            summary,
            order: None,
            auth: None,
            error_kind: None,
            session: None,
            login_url: None,
        }
    }

    pub fn validation(err: &ValidationError) -> Self {
        Self {
            success: false,
            kind: ResultKind::ValidationError,
            summary: err.to_string(),
            ..Self::ok(String::new())
        }
    }

    pub fn auth_required(reason: ReauthReason, login_url: String) -> Self {
        Self {
            success: false,
            kind: ResultKind::AuthRequired,
            summary: format!("Authentication required: {}. Log in at: {}", reason, login_url),
            auth: Some(AuthRequired { reason, login_url }),
            ..Self::ok(String::new())
        }
    }

    pub fn trade_error(err: &TradeError, summary: String) -> Self {
        Self {
            success: false,
            kind: ResultKind::TradeError,
            summary,
            error_kind: Some(err.kind().to_string()),
            ..Self::ok(String::new())
        }
    }
}

/// Failures that are not part of the tool result contract
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    UnknownTool(String),
    /// Token store could not be read
    Internal(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::UnknownTool(name) => write!(f, "Unknown tool: {}", name),
            DispatchError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for DispatchError {}

pub struct ToolDispatcher {
    guard: SessionGuard,
    broker: Arc<dyn Broker>,
    order_log: OrderLog,
    login_url: String,
    redirect_url: String,
    headless: bool,
    callback_port: u16,
}

impl ToolDispatcher {
    pub fn new(config: &KiteConfig, store: Arc<dyn TokenStore>, broker: Arc<dyn Broker>) -> Self {
        Self {
            guard: SessionGuard::new(store, config.api_key.clone()),
            broker,
            order_log: OrderLog::new(&config.order_log),
            login_url: build_login_url(&config.login_url, &config.api_key, &config.redirect_url),
            redirect_url: config.redirect_url.clone(),
            headless: config.headless,
            callback_port: config.callback_port,
        }
    }

    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    /// Dispatch by tool name
    pub async fn call_by_name(&self, name: &str, args: &Value) -> Result<ToolResult, DispatchError> {
        let tool = Tool::from_name(name).ok_or_else(|| DispatchError::UnknownTool(name.to_string()))?;
        self.call(tool, args).await
    }

    pub async fn call(&self, tool: Tool, args: &Value) -> Result<ToolResult, DispatchError> {
        info!(tool = tool.name(), "Tool call");
        match tool {
            Tool::CheckAuthenticationStatus => self.authentication_status(),
            Tool::GetKiteLoginUrl => Ok(self.login_instructions()),
            Tool::BuyStock => self.trade(Side::Buy, args).await,
            Tool::SellStock => self.trade(Side::Sell, args).await,
            Tool::ShowPortfolio => self.portfolio().await,
            Tool::ServerHealthCheck => self.health(),
        }
    }

    fn session_state(&self) -> Result<SessionState, DispatchError> {
        self.guard.state().map_err(|e| {
            warn!("Failed to read token store: {:#}", e);
            DispatchError::Internal(format!("{:#}", e))
        })
    }

    /// Valid session or the auth_required result to return instead
    fn authorize(&self) -> Result<Result<CredentialRecord, ToolResult>, DispatchError> {
        match Directive::from(self.session_state()?) {
            Directive::Pass(record) => Ok(Ok(record)),
            Directive::Reauthenticate(reason) => {
                info!(reason = %reason, "Privileged call needs re-authentication");
                Ok(Err(ToolResult::auth_required(reason, self.login_url.clone())))
            }
        }
    }

    async fn trade(&self, side: Side, args: &Value) -> Result<ToolResult, DispatchError> {
        let order = match parse_order(args, side) {
            Ok(order) => order,
            Err(e) => return Ok(ToolResult::validation(&e)),
        };

        let session = match self.authorize()? {
            Ok(session) => session,
            Err(result) => return Ok(result),
        };

        let result = match self.broker.place_order(&session, &order).await {
            Ok(confirmation) => {
                let placed = OrderLogOutcome::Placed {
                    order_id: &confirmation.order_id,
                };
                self.log_order(&order, placed);
                ToolResult {
                    order: Some(OrderSummary {
                        order_id: confirmation.order_id.clone(),
                        symbol: order.symbol.clone(),
                        quantity: order.quantity,
                        side,
                    }),
                    ..ToolResult::ok(format!(
                        "{} order placed for {} shares of {}. Order ID: {}",
                        side, order.quantity, order.symbol, confirmation.order_id
                    ))
                }
            }
            Err(e) => {
                warn!(symbol = %order.symbol, side = %side, error = %e, "Order failed");
                self.log_order(&order, OrderLogOutcome::Failed(&e));
                let summary = format!(
                    "{} order for {} shares of {} failed: {}",
                    side, order.quantity, order.symbol, e
                );
                ToolResult::trade_error(&e, self.with_relogin_hint(&e, summary))
            }
        };
        Ok(result)
    }

    async fn portfolio(&self) -> Result<ToolResult, DispatchError> {
        let session = match self.authorize()? {
            Ok(session) => session,
            Err(result) => return Ok(result),
        };

        match self.broker.portfolio(&session).await {
            Ok(portfolio) => Ok(ToolResult::ok(portfolio.summary())),
            Err(e) => {
                warn!(error = %e, "Portfolio fetch failed");
                let summary = format!("Could not fetch portfolio: {}", e);
                Ok(ToolResult::trade_error(&e, self.with_relogin_hint(&e, summary)))
            }
        }
    }

    fn with_relogin_hint(&self, err: &TradeError, summary: String) -> String {
        match err {
            TradeError::SessionRejected(_) => {
                format!("{}. Log in again at: {}", summary, self.login_url)
            }
            _ => summary,
        }
    }

    fn log_order(&self, order: &OrderRequest, outcome: OrderLogOutcome<'_>) {
        if let Err(e) = self.order_log.record(order, outcome) {
            warn!("Failed to append order log: {:#}", e);
        }
    }

    fn login_instructions(&self) -> ToolResult {
        let mut summary = format!(
            "Open this URL to log in to Kite:\n{}\n\nAfter login the broker redirects to {} and the session is stored automatically.",
            self.login_url, self.redirect_url
        );
        if self.headless {
            summary.push_str(&format!(
                "\n\nIf the redirect cannot reach this server, copy the full URL from the browser address bar and POST it as {{\"callback_url\": \"...\"}} to /auth/exchange on port {}.",
                self.callback_port
            ));
        }
        ToolResult {
            login_url: Some(self.login_url.clone()),
            ..ToolResult::ok(summary)
        }
    }

    fn authentication_status(&self) -> Result<ToolResult, DispatchError> {
        let state = self.session_state()?;
        let session = SessionInfo::from(&state);

        let result = match Directive::from(state) {
            Directive::Pass(record) => ToolResult::ok(format!(
                "Authenticated with Kite{}. Session valid until {}.",
                record
                    .user_id
                    .as_deref()
                    .map(|u| format!(" as {}", u))
                    .unwrap_or_default(),
                record.expires_at.to_rfc3339()
            )),
            Directive::Reauthenticate(reason) => ToolResult {
                summary: format!("Not authenticated: {}. Log in at: {}", reason, self.login_url),
                auth: Some(AuthRequired {
                    reason,
                    login_url: self.login_url.clone(),
                }),
                ..ToolResult::ok(String::new())
            },
        };

        Ok(ToolResult {
            session: Some(session),
            ..result
        })
    }

    fn health(&self) -> Result<ToolResult, DispatchError> {
        let state = self.session_state()?;
        Ok(ToolResult {
            session: Some(SessionInfo::from(&state)),
            ..ToolResult::ok(format!("MCP server is healthy. Session: {}.", state.label()))
        })
    }
}
