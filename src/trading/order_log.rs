//! Append-only audit log of order attempts.
//!
//! One line per attempt:
//! `timestamp | SUCCESS | BUY | RELIANCE | Qty: 10 | NSE | CNC | MARKET | OrderID: ...`

use super::{OrderRequest, TradeError, EXCHANGE, ORDER_TYPE, PRODUCT};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// What happened to an order
pub enum OrderLogOutcome<'a> {
    Placed { order_id: &'a str },
    Failed(&'a TradeError),
}

pub struct OrderLog {
    path: PathBuf,
    /// Keeps lines from concurrent tool calls whole
    lock: Mutex<()>,
}

impl OrderLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Format one log line (without trailing newline)
    pub fn format_line(at: DateTime<Utc>, order: &OrderRequest, outcome: &OrderLogOutcome<'_>) -> String {
        let (status, detail) = match outcome {
            OrderLogOutcome::Placed { order_id } => ("SUCCESS", format!("OrderID: {}", order_id)),
            OrderLogOutcome::Failed(err) if err.is_broker_answer() => (
                "REJECTED",
                format!("OrderID: NOT_CREATED | ErrorCode: {} | ErrorMsg: {}", err.kind(), err),
            ),
            OrderLogOutcome::Failed(err) => {
                ("ERROR", format!("OrderID: NOT_CREATED | Error: {}", err))
            }
        };

        format!(
            "{} | {} | {} | {} | Qty: {} | {} | {} | {} | {}",
            at.to_rfc3339(),
            status,
            order.side,
            order.symbol,
            order.quantity,
            EXCHANGE,
            PRODUCT,
            ORDER_TYPE,
            detail
        )
    }

    /// Append a line for `order`
    pub fn record(&self, order: &OrderRequest, outcome: OrderLogOutcome<'_>) -> Result<()> {
        let line = Self::format_line(Utc::now(), order, &outcome);

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open order log {}", self.path.display()))?;
        writeln!(file, "{}", line)
            .with_context(|| format!("Failed to write order log {}", self.path.display()))?;
        Ok(())
    }
}
