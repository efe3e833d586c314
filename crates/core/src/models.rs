use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Command vocabulary
// ---------------------------------------------------------------------------

/// The fixed set of commands the terminal understands.
///
/// Serialized in camelCase, which is the exact string the terminal matches on
/// (e.g. `getBalance`, `closeAllMarketOrders`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandName {
    GetBalance,
    MarketOrder,
    LimitOrder,
    CloseMarketOrder,
    ClosePendingOrder,
    CloseAllMarketOrders,
    CloseAllPendingOrders,
    GetAllMarketOrders,
    GetAllPendingOrders,
    ModifyOrder,
    Ping,
}

/// Timeout family a command belongs to.
///
/// Queries answer from terminal state and are fast; trades wait on the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandFamily {
    Query,
    Trade,
}

impl fmt::Display for CommandFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandFamily::Query => f.write_str("query"),
            CommandFamily::Trade => f.write_str("trade"),
        }
    }
}

impl CommandName {
    pub const ALL: [CommandName; 11] = [
        CommandName::GetBalance,
        CommandName::MarketOrder,
        CommandName::LimitOrder,
        CommandName::CloseMarketOrder,
        CommandName::ClosePendingOrder,
        CommandName::CloseAllMarketOrders,
        CommandName::CloseAllPendingOrders,
        CommandName::GetAllMarketOrders,
        CommandName::GetAllPendingOrders,
        CommandName::ModifyOrder,
        CommandName::Ping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::GetBalance => "getBalance",
            CommandName::MarketOrder => "marketOrder",
            CommandName::LimitOrder => "limitOrder",
            CommandName::CloseMarketOrder => "closeMarketOrder",
            CommandName::ClosePendingOrder => "closePendingOrder",
            CommandName::CloseAllMarketOrders => "closeAllMarketOrders",
            CommandName::CloseAllPendingOrders => "closeAllPendingOrders",
            CommandName::GetAllMarketOrders => "getAllMarketOrders",
            CommandName::GetAllPendingOrders => "getAllPendingOrders",
            CommandName::ModifyOrder => "modifyOrder",
            CommandName::Ping => "ping",
        }
    }

    pub fn family(&self) -> CommandFamily {
        match self {
            CommandName::GetBalance
            | CommandName::GetAllMarketOrders
            | CommandName::GetAllPendingOrders
            | CommandName::Ping => CommandFamily::Query,
            CommandName::MarketOrder
            | CommandName::LimitOrder
            | CommandName::CloseMarketOrder
            | CommandName::ClosePendingOrder
            | CommandName::CloseAllMarketOrders
            | CommandName::CloseAllPendingOrders
            | CommandName::ModifyOrder => CommandFamily::Trade,
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| format!("Unknown command: {}", s))
    }
}

// ---------------------------------------------------------------------------
// Command parameters
// ---------------------------------------------------------------------------

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("buy"),
            Side::Sell => f.write_str("sell"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "long" => Ok(Side::Buy),
            "sell" | "short" => Ok(Side::Sell),
            other => Err(format!("Unknown side: {}", other)),
        }
    }
}

/// Command-specific fields, flattened into the top level of the command file.
///
/// Every field is optional. For `modifyOrder` an absent field means
/// "leave unchanged". Decimals go over the wire as JSON numbers because the
/// terminal parses them with its own double-based reader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub lots: Option<Decimal>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub price: Option<Decimal>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub stop_loss: Option<Decimal>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub take_profit: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl CommandParams {
    /// Parameters addressing a single order by ticket.
    pub fn ticket(ticket: u64) -> Self {
        Self {
            ticket: Some(ticket),
            ..Default::default()
        }
    }
}

/// A single request directed at the terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: String,
    pub name: CommandName,
    pub params: CommandParams,
}

impl Command {
    /// Create a command with a fresh, process-unique id.
    pub fn new(name: CommandName, params: CommandParams) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), name, params)
    }

    /// Create a command with a caller-generated id.
    pub fn with_id(id: impl Into<String>, name: CommandName, params: CommandParams) -> Self {
        Self {
            id: id.into(),
            name,
            params,
        }
    }
}

// ---------------------------------------------------------------------------
// Order requests
// ---------------------------------------------------------------------------

/// Open a position at market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub lots: Decimal,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl MarketOrderRequest {
    pub fn new(symbol: &str, side: Side, lots: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            lots,
            stop_loss: None,
            take_profit: None,
            comment: None,
        }
    }
}

impl From<MarketOrderRequest> for CommandParams {
    fn from(order: MarketOrderRequest) -> Self {
        Self {
            symbol: Some(order.symbol),
            side: Some(order.side),
            lots: Some(order.lots),
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            comment: order.comment,
            ..Default::default()
        }
    }
}

/// Place a pending limit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub lots: Decimal,
    pub price: Decimal,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl LimitOrderRequest {
    pub fn new(symbol: &str, side: Side, lots: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            lots,
            price,
            stop_loss: None,
            take_profit: None,
            comment: None,
        }
    }
}

impl From<LimitOrderRequest> for CommandParams {
    fn from(order: LimitOrderRequest) -> Self {
        Self {
            symbol: Some(order.symbol),
            side: Some(order.side),
            lots: Some(order.lots),
            price: Some(order.price),
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            comment: order.comment,
            ..Default::default()
        }
    }
}

/// Modify an open or pending order. `None` fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifyOrderRequest {
    pub ticket: u64,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
}

impl From<ModifyOrderRequest> for CommandParams {
    fn from(request: ModifyOrderRequest) -> Self {
        Self {
            ticket: Some(request.ticket),
            price: request.price,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Ticket number assigned by the terminal to a newly placed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderTicket(pub u64);

impl OrderTicket {
    /// Accepts either a bare ticket number or an object carrying `ticket`.
    pub fn from_result(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(OrderTicket),
            Value::String(s) => s.trim().parse().ok().map(OrderTicket),
            Value::Object(map) => map.get("ticket").and_then(Self::from_result),
            _ => None,
        }
    }
}

impl fmt::Display for OrderTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An order as reported by the terminal's order listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOrder {
    pub ticket: u64,
    pub symbol: String,
    /// Terminal order type, e.g. `buy`, `sell`, `buy_limit`.
    #[serde(alias = "type")]
    pub kind: String,
    #[serde(alias = "volume", with = "rust_decimal::serde::float")]
    pub lots: Decimal,
    #[serde(
        default,
        alias = "openPrice",
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub price: Option<Decimal>,
    #[serde(
        default,
        alias = "sl",
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub stop_loss: Option<Decimal>,
    #[serde(
        default,
        alias = "tp",
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub take_profit: Option<Decimal>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub profit: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Read a decimal out of a terminal result.
///
/// Numbers are converted through their JSON text so `10532.40` stays exact.
pub fn decimal_from_result(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .ok()
            .or_else(|| n.as_f64().and_then(Decimal::from_f64)),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        Value::Object(map) => map.get("balance").and_then(decimal_from_result),
        _ => None,
    }
}

/// Read an order listing: a bare array, an object with `orders`, or `null`.
pub fn orders_from_result(value: &Value) -> Result<Vec<TerminalOrder>, String> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => serde_json::from_value(value.clone()).map_err(|e| e.to_string()),
        Value::Object(map) => match map.get("orders") {
            Some(orders) => orders_from_result(orders),
            None => Err("object without an `orders` field".to_string()),
        },
        other => Err(format!("expected an order list, got {}", other)),
    }
}

// ---------------------------------------------------------------------------
// Observability
// ---------------------------------------------------------------------------

/// Snapshot of the command currently awaiting a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub id: String,
    pub command: CommandName,
    pub submitted_at: DateTime<Utc>,
    pub timeout_ms: u64,
    /// The deadline has passed but no tick has freed the slot yet.
    pub expired: bool,
}
