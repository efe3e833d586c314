mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mtbridge_core::*;
use mtbridge_metatrader::{Bridge, FileChannel};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "mtbridge")]
#[command(about = "File bridge between a MetaTrader terminal and a request/response API")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Path to a TOML config file
    #[arg(short, long, env = "MTBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory shared with the terminal (overrides the config file)
    #[arg(short, long, env = "MTBRIDGE_DIR")]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge behind the HTTP API
    Serve {
        /// Bind address
        #[arg(short, long, default_value = "127.0.0.1:3000")]
        bind: String,

        /// Ping the terminal whenever the bridge is idle
        #[arg(long)]
        keep_alive: bool,
    },

    /// Send a single command and print the terminal's answer
    ///
    /// Files already in the directory are left alone, so this can run next to
    /// `serve`; a command the terminal has not consumed yet makes it fail busy.
    Send {
        /// Override the command family's timeout
        #[arg(long)]
        timeout_ms: Option<u64>,

        #[command(subcommand)]
        command: SendCommands,
    },

    /// Remove command, response, and temp files left by a previous run
    Clean,

    /// List the commands the terminal understands
    Commands,
}

#[derive(Subcommand)]
enum SendCommands {
    /// Account balance
    Balance,
    /// Liveness check
    Ping,
    /// Open market orders
    Orders,
    /// Pending orders
    PendingOrders,
    /// Open a position at market
    Market {
        symbol: String,
        /// buy or sell
        side: Side,
        lots: Decimal,
        #[arg(long)]
        sl: Option<Decimal>,
        #[arg(long)]
        tp: Option<Decimal>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Place a pending limit order
    Limit {
        symbol: String,
        /// buy or sell
        side: Side,
        lots: Decimal,
        price: Decimal,
        #[arg(long)]
        sl: Option<Decimal>,
        #[arg(long)]
        tp: Option<Decimal>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Close an open position
    Close { ticket: u64 },
    /// Delete a pending order
    ClosePending { ticket: u64 },
    /// Close every open position
    CloseAll,
    /// Delete every pending order
    CloseAllPending,
    /// Change price, stop loss, or take profit of an order
    Modify {
        ticket: u64,
        #[arg(long)]
        price: Option<Decimal>,
        #[arg(long)]
        sl: Option<Decimal>,
        #[arg(long)]
        tp: Option<Decimal>,
    },
}

impl SendCommands {
    fn into_command(self) -> (CommandName, CommandParams) {
        match self {
            SendCommands::Balance => (CommandName::GetBalance, CommandParams::default()),
            SendCommands::Ping => (CommandName::Ping, CommandParams::default()),
            SendCommands::Orders => (CommandName::GetAllMarketOrders, CommandParams::default()),
            SendCommands::PendingOrders => {
                (CommandName::GetAllPendingOrders, CommandParams::default())
            }
            SendCommands::Market {
                symbol,
                side,
                lots,
                sl,
                tp,
                comment,
            } => {
                let mut order = MarketOrderRequest::new(&symbol, side, lots);
                order.stop_loss = sl;
                order.take_profit = tp;
                order.comment = comment;
                (CommandName::MarketOrder, order.into())
            }
            SendCommands::Limit {
                symbol,
                side,
                lots,
                price,
                sl,
                tp,
                comment,
            } => {
                let mut order = LimitOrderRequest::new(&symbol, side, lots, price);
                order.stop_loss = sl;
                order.take_profit = tp;
                order.comment = comment;
                (CommandName::LimitOrder, order.into())
            }
            SendCommands::Close { ticket } => {
                (CommandName::CloseMarketOrder, CommandParams::ticket(ticket))
            }
            SendCommands::ClosePending { ticket } => {
                (CommandName::ClosePendingOrder, CommandParams::ticket(ticket))
            }
            SendCommands::CloseAll => (CommandName::CloseAllMarketOrders, CommandParams::default()),
            SendCommands::CloseAllPending => {
                (CommandName::CloseAllPendingOrders, CommandParams::default())
            }
            SendCommands::Modify {
                ticket,
                price,
                sl,
                tp,
            } => {
                let request = ModifyOrderRequest {
                    ticket,
                    price,
                    stop_loss: sl,
                    take_profit: tp,
                };
                (CommandName::ModifyOrder, request.into())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.json_logs {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).with_target(false).init();
    }

    let mut bridge_config = config::load_config(cli.config.as_deref(), cli.dir)?;

    match cli.command {
        Commands::Serve { bind, keep_alive } => {
            bridge_config.keep_alive |= keep_alive;
            serve(bridge_config, &bind).await?;
        }
        Commands::Send {
            timeout_ms,
            command,
        } => {
            let (name, params) = command.into_command();
            send_once(bridge_config, name, params, timeout_ms.map(Duration::from_millis)).await?;
        }
        Commands::Clean => {
            if !bridge_config.base_dir.exists() {
                println!("Nothing to clean: {} does not exist", bridge_config.base_dir.display());
                return Ok(());
            }
            let removed = FileChannel::new(&bridge_config).clear_stale()?;
            println!("Removed {} stale file(s) from {}", removed, bridge_config.base_dir.display());
        }
        Commands::Commands => {
            println!("Terminal commands:");
            for name in CommandName::ALL {
                let timeout = bridge_config.timeouts.for_command(name);
                println!(
                    "  {:<22} {:<6} timeout {}ms",
                    name,
                    name.family().to_string(),
                    timeout.as_millis()
                );
            }
        }
    }

    Ok(())
}

async fn serve(config: BridgeConfig, bind: &str) -> Result<()> {
    let bridge = Bridge::new(config);
    bridge.start().await?;

    let served = mtbridge_api::start_server(Arc::new(bridge.clone()), bind, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown requested");
    })
    .await;

    bridge.stop().await;
    served
}

async fn send_once(
    config: BridgeConfig,
    name: CommandName,
    params: CommandParams,
    timeout: Option<Duration>,
) -> Result<()> {
    let bridge = Bridge::new(config);
    bridge.start_without_reset().await?;

    tracing::info!(command = %name, "Sending command");
    let result = bridge.send_command(name, params, timeout).await;
    bridge.stop().await;

    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
