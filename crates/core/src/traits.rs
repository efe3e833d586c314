use crate::models::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Bridge errors
// ---------------------------------------------------------------------------

/// Errors a bridge call can end with.
///
/// Only `Busy`, `Timeout` and `Rejected` come out of the correlation protocol
/// itself. `MalformedPayload` is raised by the codec and absorbed by the
/// poller; it never reaches a caller.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Bridge busy: {0}")]
    Busy(String),
    #[error("Command {command} ({id}) timed out after {timeout_ms}ms")]
    Timeout {
        id: String,
        command: CommandName,
        timeout_ms: u64,
    },
    #[error("Command rejected by terminal: {0}")]
    Rejected(String),
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Pending command {0} was cleared")]
    Cleared(String),
    #[error("Bridge is not running")]
    Stopped,
    #[error("Unexpected result for {command}: {message}")]
    InvalidResult {
        command: CommandName,
        message: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn invalid_result(command: CommandName, message: impl Into<String>) -> Self {
        BridgeError::InvalidResult {
            command,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Terminal bridge trait
// ---------------------------------------------------------------------------

/// Request/response access to a trading terminal.
///
/// Implementors provide `send_command` and the pending-slot hooks; the named
/// operations are parameter-shaping wrappers with typed results. Passing
/// `None` as the timeout selects the command family's default.
#[async_trait]
pub trait TerminalBridge: Send + Sync {
    /// Send one command and wait for the terminal's answer.
    async fn send_command(
        &self,
        name: CommandName,
        params: CommandParams,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError>;

    /// The command currently awaiting a response, if any.
    async fn pending_command(&self) -> Option<PendingCommand>;

    /// Drop the pending command locally. The terminal may still act on it.
    async fn clear_pending_command(&self) -> Option<PendingCommand>;

    async fn get_balance(&self) -> Result<Decimal, BridgeError> {
        let name = CommandName::GetBalance;
        let value = self
            .send_command(name, CommandParams::default(), None)
            .await?;
        decimal_from_result(&value)
            .ok_or_else(|| BridgeError::invalid_result(name, format!("not a balance: {}", value)))
    }

    async fn place_market_order(
        &self,
        order: MarketOrderRequest,
    ) -> Result<OrderTicket, BridgeError> {
        let name = CommandName::MarketOrder;
        let value = self.send_command(name, order.into(), None).await?;
        OrderTicket::from_result(&value)
            .ok_or_else(|| BridgeError::invalid_result(name, format!("not a ticket: {}", value)))
    }

    async fn place_limit_order(&self, order: LimitOrderRequest) -> Result<OrderTicket, BridgeError> {
        let name = CommandName::LimitOrder;
        let value = self.send_command(name, order.into(), None).await?;
        OrderTicket::from_result(&value)
            .ok_or_else(|| BridgeError::invalid_result(name, format!("not a ticket: {}", value)))
    }

    /// Close an open market position by ticket.
    async fn close_order(&self, ticket: u64) -> Result<Value, BridgeError> {
        self.send_command(
            CommandName::CloseMarketOrder,
            CommandParams::ticket(ticket),
            None,
        )
        .await
    }

    /// Delete a pending order by ticket.
    async fn close_pending_order(&self, ticket: u64) -> Result<Value, BridgeError> {
        self.send_command(
            CommandName::ClosePendingOrder,
            CommandParams::ticket(ticket),
            None,
        )
        .await
    }

    async fn modify_order(&self, request: ModifyOrderRequest) -> Result<Value, BridgeError> {
        self.send_command(CommandName::ModifyOrder, request.into(), None)
            .await
    }

    async fn get_open_orders(&self) -> Result<Vec<TerminalOrder>, BridgeError> {
        let name = CommandName::GetAllMarketOrders;
        let value = self
            .send_command(name, CommandParams::default(), None)
            .await?;
        orders_from_result(&value).map_err(|e| BridgeError::invalid_result(name, e))
    }

    async fn get_pending_orders(&self) -> Result<Vec<TerminalOrder>, BridgeError> {
        let name = CommandName::GetAllPendingOrders;
        let value = self
            .send_command(name, CommandParams::default(), None)
            .await?;
        orders_from_result(&value).map_err(|e| BridgeError::invalid_result(name, e))
    }

    async fn close_all_market_orders(&self) -> Result<Value, BridgeError> {
        self.send_command(
            CommandName::CloseAllMarketOrders,
            CommandParams::default(),
            None,
        )
        .await
    }

    async fn close_all_pending_orders(&self) -> Result<Value, BridgeError> {
        self.send_command(
            CommandName::CloseAllPendingOrders,
            CommandParams::default(),
            None,
        )
        .await
    }

    /// Round-trip a `ping`. Any successful answer counts as alive.
    async fn ping(&self) -> Result<(), BridgeError> {
        self.send_command(CommandName::Ping, CommandParams::default(), None)
            .await
            .map(|_| ())
    }
}
