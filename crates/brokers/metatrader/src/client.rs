use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mtbridge_core::*;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::correlator::Reply;
use crate::poller::{spawn_poller, PollerHandle, Transport};

const MIN_TICK: Duration = Duration::from_millis(1);

/// MetaTrader file bridge.
///
/// Talks to an EA running inside the terminal through two JSON files in a
/// shared directory. At most one command is outstanding at a time; a second
/// `send_command` while one is in flight fails with `BridgeError::Busy`
/// (use [`Bridge::enqueue`] to wait for a free slot instead).
///
/// Cloning is cheap and every clone drives the same bridge. Separate
/// instances pointed at separate directories do not interact.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    config: BridgeConfig,
    transport: Arc<Transport>,
    poller: Mutex<Option<PollerHandle>>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let transport = Arc::new(Transport::new(&config));
        Self {
            inner: Arc::new(BridgeInner {
                config,
                transport,
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Clear stale files from a previous run and start polling.
    pub async fn start(&self) -> Result<(), BridgeError> {
        self.start_polling(true).await
    }

    /// Start polling without touching files already in the directory.
    ///
    /// For short-lived clients sharing a directory with a running bridge,
    /// whose in-flight command and response must survive. A leftover command
    /// file makes the first call fail with `BridgeError::Busy`.
    pub async fn start_without_reset(&self) -> Result<(), BridgeError> {
        self.start_polling(false).await
    }

    async fn start_polling(&self, reset: bool) -> Result<(), BridgeError> {
        let mut poller = self.inner.poller.lock().await;
        if poller.is_some() {
            warn!("Bridge already running");
            return Ok(());
        }

        let cleared = if reset {
            self.inner.transport.reset().await?
        } else {
            self.inner.transport.channel().ensure_dir()?;
            0
        };
        let config = &self.inner.config;
        *poller = Some(spawn_poller(
            Arc::clone(&self.inner.transport),
            config.submit_interval().max(MIN_TICK),
            config.collect_interval().max(MIN_TICK),
        ));

        info!(
            dir = %config.base_dir.display(),
            cleared,
            submit_ms = config.submit_interval_ms,
            collect_ms = config.collect_interval_ms,
            keep_alive = config.keep_alive,
            "Bridge started"
        );
        Ok(())
    }

    /// Stop polling.
    ///
    /// A command already written keeps its caller waiting until the caller's
    /// own timeout. Queued commands that were never written fail with
    /// `BridgeError::Stopped`.
    pub async fn stop(&self) {
        let Some(handle) = self.inner.poller.lock().await.take() else {
            return;
        };
        handle.stop().await;
        let drained = self.inner.transport.drain_queue().await;
        info!(drained, "Bridge stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.poller.lock().await.is_some()
    }

    /// Send a caller-built command and wait for its response.
    pub async fn dispatch(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        if !self.is_running().await {
            return Err(BridgeError::Stopped);
        }

        let transport = &self.inner.transport;
        let timeout = transport.timeout_for(command.name, timeout);
        let id = command.id.clone();
        debug!(id = %id, command = %command.name, "Dispatching command");

        let mut reply = transport.dispatch(command, timeout).await?;
        match tokio::time::timeout(timeout, &mut reply).await {
            Ok(received) => flatten_reply(&id, received),
            Err(_) => {
                // Settle the slot ourselves; if a tick got there first the
                // receiver already holds that outcome.
                transport.expire_command(&id).await;
                flatten_reply(&id, reply.await)
            }
        }
    }

    /// Queue a command behind the one in flight instead of failing with `Busy`.
    ///
    /// The timeout starts when the submit tick writes the command, and is
    /// enforced by the poller and by [`QueuedReply::wait`].
    pub async fn enqueue(
        &self,
        name: CommandName,
        params: CommandParams,
        timeout: Option<Duration>,
    ) -> Result<QueuedReply, BridgeError> {
        if !self.is_running().await {
            return Err(BridgeError::Stopped);
        }

        let transport = &self.inner.transport;
        let command = Command::new(name, params);
        let id = command.id.clone();
        let timeout = transport.timeout_for(name, timeout);
        let reply = transport.enqueue(command, timeout).await;
        Ok(QueuedReply {
            id,
            timeout,
            reply,
            transport: Arc::clone(transport),
        })
    }

    /// When the terminal last answered a `ping`.
    pub async fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.inner.transport.last_heartbeat().await
    }
}

fn flatten_reply(id: &str, received: Result<Reply, oneshot::error::RecvError>) -> Reply {
    received.unwrap_or_else(|_| Err(BridgeError::Cleared(id.to_string())))
}

#[async_trait]
impl TerminalBridge for Bridge {
    async fn send_command(
        &self,
        name: CommandName,
        params: CommandParams,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        self.dispatch(Command::new(name, params), timeout).await
    }

    async fn pending_command(&self) -> Option<PendingCommand> {
        self.inner.transport.pending().await
    }

    async fn clear_pending_command(&self) -> Option<PendingCommand> {
        self.inner.transport.clear_pending().await
    }
}

/// Eventual answer to a queued command.
pub struct QueuedReply {
    id: String,
    timeout: Duration,
    reply: oneshot::Receiver<Reply>,
    transport: Arc<Transport>,
}

impl QueuedReply {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the terminal's answer.
    ///
    /// Time spent in the queue does not count against the timeout. Once the
    /// command is written, its deadline is enforced here as well as by the
    /// poller, so a command in flight when the bridge stops still times out.
    pub async fn wait(mut self) -> Result<Value, BridgeError> {
        loop {
            match tokio::time::timeout(self.timeout, &mut self.reply).await {
                Ok(received) => return received.unwrap_or(Err(BridgeError::Stopped)),
                Err(_) => self.transport.expire_if_overdue().await,
            }
        }
    }
}
