//! Argument validation for order tools. Runs before the session guard.

use crate::trading::{OrderRequest, Side};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq)]
pub enum ValidationError {
    MissingField(&'static str),
    InvalidSymbol(String),
    InvalidQuantity(String),
    /// Arguments were not a JSON object
    InvalidArguments(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MissingField(field) => write!(f, "Missing required field '{}'", field),
            ValidationError::InvalidSymbol(msg) => write!(f, "Invalid stock symbol: {}", msg),
            ValidationError::InvalidQuantity(msg) => write!(f, "Invalid quantity: {}", msg),
            ValidationError::InvalidArguments(msg) => write!(f, "Invalid arguments: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

/// First present field among `names`
fn field<'a>(args: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| args.get(name)).filter(|v| !v.is_null())
}

/// Trimmed, upper-cased NSE symbol (`RELIANCE`, `M&M`, `BAJAJ-AUTO`)
pub fn normalize_symbol(raw: &Value) -> Result<String, ValidationError> {
    let raw = raw
        .as_str()
        .ok_or_else(|| ValidationError::InvalidSymbol("must be a string".to_string()))?;

    let symbol = raw.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(ValidationError::InvalidSymbol("must not be empty".to_string()));
    }
    if let Some(c) = symbol
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '&' | '_' | '.')))
    {
        return Err(ValidationError::InvalidSymbol(format!(
            "unexpected character '{}' in '{}'",
            c, symbol
        )));
    }
    Ok(symbol)
}

/// Positive whole number of shares
pub fn parse_quantity(raw: &Value) -> Result<u32, ValidationError> {
    let Value::Number(number) = raw else {
        return Err(ValidationError::InvalidQuantity("must be an integer".to_string()));
    };

    if let Some(n) = number.as_u64() {
        return match n {
            0 => Err(ValidationError::InvalidQuantity("must be greater than zero".to_string())),
            n => u32::try_from(n)
                .map_err(|_| ValidationError::InvalidQuantity(format!("{} is too large", n))),
        };
    }
    if number.as_i64().is_some() {
        return Err(ValidationError::InvalidQuantity("must be greater than zero".to_string()));
    }
    Err(ValidationError::InvalidQuantity("must be a whole number".to_string()))
}

/// Build an order from tool arguments `{ "stock": ..., "qty": ... }`.
///
/// `symbol` and `quantity` are accepted as aliases.
pub fn parse_order(args: &Value, side: Side) -> Result<OrderRequest, ValidationError> {
    if !(args.is_object() || args.is_null()) {
        return Err(ValidationError::InvalidArguments("expected an object".to_string()));
    }

    let symbol = field(args, &["stock", "symbol"]).ok_or(ValidationError::MissingField("stock"))?;
    let quantity = field(args, &["qty", "quantity"]).ok_or(ValidationError::MissingField("qty"))?;

    Ok(OrderRequest {
        symbol: normalize_symbol(symbol)?,
        quantity: parse_quantity(quantity)?,
        side,
    })
}
