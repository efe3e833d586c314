//! Submit/collect ticks and the task that drives them.
//!
//! All slot, queue, and file mutations happen under one mutex, so the ticks
//! and the facade's admission path behave like a single actor.

use crate::channel::FileChannel;
use crate::correlator::{duration_ms, Correlator, Reply, Resolution, Settlement};
use crate::protocol::encode_command;
use chrono::{DateTime, Utc};
use mtbridge_core::{
    BridgeConfig, BridgeError, Command, CommandName, CommandParams, PendingCommand, TimeoutConfig,
};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

struct Queued {
    command: Command,
    timeout: Duration,
    reply: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct TransportState {
    correlator: Correlator,
    queue: VecDeque<Queued>,
    /// Last stale response id reported, so a lingering file is logged once.
    last_stale_id: Option<String>,
    last_heartbeat: Option<DateTime<Utc>>,
}

pub(crate) struct Transport {
    channel: FileChannel,
    timeouts: TimeoutConfig,
    keep_alive: bool,
    state: Mutex<TransportState>,
}

impl Transport {
    pub(crate) fn new(config: &BridgeConfig) -> Self {
        Self {
            channel: FileChannel::new(config),
            timeouts: config.timeouts.clone(),
            keep_alive: config.keep_alive,
            state: Mutex::new(TransportState::default()),
        }
    }

    pub(crate) fn channel(&self) -> &FileChannel {
        &self.channel
    }

    pub(crate) fn timeout_for(&self, name: CommandName, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or_else(|| self.timeouts.for_command(name))
    }

    /// Prepare the directory and drop files left over from a previous run.
    pub(crate) async fn reset(&self) -> io::Result<usize> {
        let mut state = self.state.lock().await;
        self.channel.ensure_dir()?;
        state.last_stale_id = None;
        self.channel.clear_stale()
    }

    /// Admit `command` and write it to disk.
    ///
    /// Fails immediately with `Busy` when a command is outstanding or the
    /// previous command file has not been consumed. A failed write frees the
    /// slot and is reported through the returned receiver.
    pub(crate) async fn dispatch(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Reply>, BridgeError> {
        let bytes = encode_command(&command)?;
        let mut state = self.state.lock().await;
        let now = Instant::now();
        self.expire_overdue(&mut state, now);

        if let Some(pending) = state.correlator.pending_id() {
            return Err(BridgeError::Busy(format!(
                "command {} is awaiting a response",
                pending
            )));
        }
        if self.channel.command_exists() {
            return Err(BridgeError::Busy(
                "previous command file has not been consumed".to_string(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        self.admit_and_write(&mut state, &command, &bytes, timeout, tx, now)?;
        Ok(rx)
    }

    /// Queue `command` for the next free submit tick.
    pub(crate) async fn enqueue(
        &self,
        command: Command,
        timeout: Duration,
    ) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().await;
        debug!(id = %command.id, command = %command.name, depth = state.queue.len() + 1, "Command queued");
        state.queue.push_back(Queued {
            command,
            timeout,
            reply: tx,
        });
        rx
    }

    /// Time out `id` on behalf of a caller whose own deadline fired.
    pub(crate) async fn expire_command(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.correlator.expire_id(id) {
            Some(settlement) => {
                self.finish_expired(settlement);
                true
            }
            None => false,
        }
    }

    /// Expire the pending command if its deadline has passed.
    pub(crate) async fn expire_if_overdue(&self) {
        let mut state = self.state.lock().await;
        self.expire_overdue(&mut state, Instant::now());
    }

    pub(crate) async fn pending(&self) -> Option<PendingCommand> {
        let state = self.state.lock().await;
        state.correlator.pending(Instant::now())
    }

    /// Drop the pending command and its unconsumed command file.
    pub(crate) async fn clear_pending(&self) -> Option<PendingCommand> {
        let mut state = self.state.lock().await;
        let (snapshot, settlement) = state.correlator.clear(Instant::now())?;
        self.discard_command_file();
        warn!(id = %snapshot.id, command = %snapshot.command, "Pending command cleared");
        settlement.deliver();
        Some(snapshot)
    }

    /// Reject every queued command that was never written.
    pub(crate) async fn drain_queue(&self) -> usize {
        let mut state = self.state.lock().await;
        let drained = state.queue.len();
        for queued in state.queue.drain(..) {
            let _ = queued.reply.send(Err(BridgeError::Stopped));
        }
        drained
    }

    pub(crate) async fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_heartbeat
    }

    /// Flush the next queued command, or a heartbeat, when the slot is free.
    pub(crate) async fn submit_tick(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        self.expire_overdue(&mut state, now);

        if !state.correlator.is_idle() {
            return;
        }
        if self.channel.command_exists() {
            debug!("Command file not consumed yet, deferring submit");
            return;
        }

        let next = loop {
            match state.queue.pop_front() {
                Some(queued) if queued.reply.is_closed() => {
                    debug!(id = %queued.command.id, "Dropping queued command nobody awaits");
                }
                other => break other,
            }
        };

        let (command, timeout, reply) = match next {
            Some(queued) => (queued.command, queued.timeout, queued.reply),
            None if self.keep_alive => {
                let command = Command::new(CommandName::Ping, CommandParams::default());
                let timeout = self.timeouts.for_command(CommandName::Ping);
                let (tx, _rx) = oneshot::channel();
                (command, timeout, tx)
            }
            None => return,
        };

        let bytes = match encode_command(&command) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(id = %command.id, error = %e, "Dropping unencodable command");
                let _ = reply.send(Err(e));
                return;
            }
        };
        if let Err(e) = self.admit_and_write(&mut state, &command, &bytes, timeout, reply, now) {
            // The slot was checked idle under the same lock.
            error!(id = %command.id, error = %e, "Submit tick could not admit command");
        }
    }

    /// Pick up the response file and settle the pending command it answers.
    pub(crate) async fn collect_tick(&self) {
        let mut state = self.state.lock().await;
        self.expire_overdue(&mut state, Instant::now());

        let response = match self.channel.try_read_response() {
            Ok(Some(response)) => response,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "Response file unreadable, retrying next tick");
                return;
            }
        };

        match state.correlator.resolve(response) {
            Resolution::Matched(settlement) => {
                if let Err(e) = self.channel.remove_response() {
                    warn!(id = %settlement.id, error = %e, "Failed to delete response file");
                }
                self.discard_command_file();
                state.last_stale_id = None;
                if settlement.command == CommandName::Ping && settlement.outcome().is_ok() {
                    state.last_heartbeat = Some(Utc::now());
                }
                debug!(
                    id = %settlement.id,
                    command = %settlement.command,
                    elapsed_ms = duration_ms(settlement.elapsed),
                    ok = settlement.outcome().is_ok(),
                    "Command settled"
                );
                settlement.deliver();
            }
            Resolution::Stale { id, pending } => {
                if state.last_stale_id.as_deref() != Some(id.as_str()) {
                    warn!(response_id = %id, pending_id = %pending, "Discarding stale response");
                    state.last_stale_id = Some(id);
                }
            }
            Resolution::Unsolicited { id } => {
                if state.last_stale_id.as_deref() != Some(id.as_str()) {
                    warn!(response_id = %id, "Discarding response with no pending command");
                    state.last_stale_id = Some(id);
                }
            }
        }
    }

    fn admit_and_write(
        &self,
        state: &mut TransportState,
        command: &Command,
        bytes: &[u8],
        timeout: Duration,
        reply: oneshot::Sender<Reply>,
        now: Instant,
    ) -> Result<(), BridgeError> {
        if let Some(evicted) =
            state
                .correlator
                .admit(command.id.clone(), command.name, timeout, reply, now)?
        {
            self.finish_expired(evicted);
        }

        // The terminal has not seen this command yet, so any response on disk
        // belongs to an earlier one and must not answer a reused id.
        match self.channel.remove_response() {
            Ok(true) => {
                debug!(id = %command.id, "Discarded leftover response before submit");
                state.last_stale_id = None;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to remove leftover response file"),
        }

        match self.channel.write_command(bytes) {
            Ok(()) => {
                debug!(
                    id = %command.id,
                    command = %command.name,
                    timeout_ms = duration_ms(timeout),
                    "Command submitted"
                );
            }
            Err(e) => {
                error!(id = %command.id, error = %e, "Failed to write command file");
                if let Some(settlement) = state.correlator.abandon(&command.id, e.into()) {
                    settlement.deliver();
                }
            }
        }
        Ok(())
    }

    fn expire_overdue(&self, state: &mut TransportState, now: Instant) {
        if let Some(settlement) = state.correlator.expire(now) {
            self.finish_expired(settlement);
        }
    }

    fn finish_expired(&self, settlement: Settlement) {
        warn!(
            id = %settlement.id,
            command = %settlement.command,
            elapsed_ms = duration_ms(settlement.elapsed),
            "Command timed out"
        );
        self.discard_command_file();
        settlement.deliver();
    }

    /// Only one command is ever outstanding, so a command file that outlives
    /// its command is stale.
    fn discard_command_file(&self) {
        if let Err(e) = self.channel.remove_command() {
            warn!(error = %e, "Failed to delete command file");
        }
    }
}

// ---------------------------------------------------------------------------
// Poller task
// ---------------------------------------------------------------------------

/// Handle to a running poller task.
pub(crate) struct PollerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Cancel future ticks and wait for the task to finish.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!(error = %e, "Poller task failed");
            }
        }
    }
}

/// Spawn the submit and collect ticks on the current runtime.
pub(crate) fn spawn_poller(
    transport: Arc<Transport>,
    submit_every: Duration,
    collect_every: Duration,
) -> PollerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut submit = tokio::time::interval(submit_every);
        let mut collect = tokio::time::interval(collect_every);
        submit.set_missed_tick_behavior(MissedTickBehavior::Delay);
        collect.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = collect.tick() => transport.collect_tick().await,
                _ = submit.tick() => transport.submit_tick().await,
            }
        }
        info!("Poller stopped");
    });

    PollerHandle { shutdown, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::fs;
    use tempfile::TempDir;

    fn transport(dir: &TempDir) -> Transport {
        Transport::new(&BridgeConfig::with_base_dir(dir.path()))
    }

    fn written_id(transport: &Transport) -> String {
        let raw = fs::read(transport.channel().command_path()).unwrap();
        let wire: Value = serde_json::from_slice(&raw).unwrap();
        wire["id"].as_str().unwrap().to_string()
    }

    fn respond(transport: &Transport, body: Value) {
        fs::write(transport.channel().response_path(), body.to_string()).unwrap();
    }

    fn balance() -> Command {
        Command::new(CommandName::GetBalance, CommandParams::default())
    }

    #[tokio::test]
    async fn test_dispatch_writes_and_blocks_second_command() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir);

        let command = balance();
        let _rx = transport
            .dispatch(command.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(written_id(&transport), command.id);

        match transport.dispatch(balance(), Duration::from_secs(5)).await {
            Err(BridgeError::Busy(msg)) => assert!(msg.contains(&command.id)),
            other => panic!("Expected busy, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_collect_consumes_matching_response_once() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir);

        let command = balance();
        let rx = transport
            .dispatch(command.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        fs::remove_file(transport.channel().command_path()).unwrap();
        respond(&transport, json!({ "id": command.id, "result": 10532.40 }));

        transport.collect_tick().await;
        assert_eq!(rx.await.unwrap().unwrap(), json!(10532.40));
        assert!(!transport.channel().response_path().exists());
        assert!(transport.pending().await.is_none());

        transport.collect_tick().await;
        assert!(transport.channel().try_read_response().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_match_discards_unconsumed_command_file() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir);

        let command = balance();
        let _rx = transport
            .dispatch(command.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        respond(&transport, json!({ "id": command.id, "result": 1 }));
        transport.collect_tick().await;

        assert!(!transport.channel().command_exists());
        assert!(transport.dispatch(balance(), Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_response_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir);

        let command = balance();
        let mut rx = transport
            .dispatch(command.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        respond(&transport, json!({ "id": "old-command", "result": 1 }));

        transport.collect_tick().await;
        transport.collect_tick().await;
        assert!(rx.try_recv().is_err());
        assert!(transport.channel().response_path().exists());
        assert_eq!(transport.pending().await.unwrap().id, command.id);

        respond(&transport, json!({ "id": command.id, "result": "ok" }));
        transport.collect_tick().await;
        assert_eq!(rx.await.unwrap().unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_late_response_not_replayed_on_reused_id() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir);

        let first = Command::with_id("a1", CommandName::CloseMarketOrder, CommandParams::ticket(1));
        let rx = transport
            .dispatch(first, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(transport.expire_command("a1").await);
        assert!(matches!(rx.await.unwrap(), Err(BridgeError::Timeout { .. })));

        // Late answer arrives while idle and is left on disk.
        respond(&transport, json!({ "id": "a1", "result": "closed ticket 1" }));
        transport.collect_tick().await;
        assert!(transport.channel().response_path().exists());

        let second = Command::with_id("a1", CommandName::CloseMarketOrder, CommandParams::ticket(2));
        let mut rx = transport
            .dispatch(second, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!transport.channel().response_path().exists());
        assert!(transport.channel().command_exists());

        transport.collect_tick().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.pending().await.unwrap().id, "a1");
    }

    #[tokio::test]
    async fn test_partial_response_retried_next_tick() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir);

        let command = balance();
        let mut rx = transport
            .dispatch(command.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        fs::write(transport.channel().response_path(), "{\"id\":\"").unwrap();

        transport.collect_tick().await;
        assert!(rx.try_recv().is_err());
        assert!(transport.pending().await.is_some());

        respond(&transport, json!({ "id": command.id, "result": 3 }));
        transport.collect_tick().await;
        assert_eq!(rx.await.unwrap().unwrap(), json!(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_expires_overdue_command() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir);

        let rx = transport
            .dispatch(balance(), Duration::from_millis(2_000))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(1_999)).await;
        transport.collect_tick().await;
        assert!(transport.pending().await.is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        transport.collect_tick().await;
        assert!(matches!(rx.await.unwrap(), Err(BridgeError::Timeout { .. })));
        assert!(!transport.channel().command_exists());
        assert!(transport.dispatch(balance(), Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unconsumed_command_file_blocks_dispatch() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir);
        transport.channel().write_command(b"{}").unwrap();

        assert!(matches!(
            transport.dispatch(balance(), Duration::from_secs(1)).await,
            Err(BridgeError::Busy(_))
        ));
        assert!(transport.pending().await.is_none());
    }

    #[tokio::test]
    async fn test_queued_command_waits_for_free_slot() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir);

        let first = balance();
        let _first_rx = transport
            .dispatch(first.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        let queued = Command::new(CommandName::Ping, CommandParams::default());
        let queued_rx = transport
            .enqueue(queued.clone(), Duration::from_secs(5))
            .await;

        transport.submit_tick().await;
        assert_eq!(written_id(&transport), first.id);

        respond(&transport, json!({ "id": first.id, "result": 1 }));
        transport.collect_tick().await;
        transport.submit_tick().await;
        assert_eq!(written_id(&transport), queued.id);

        fs::remove_file(transport.channel().command_path()).unwrap();
        respond(&transport, json!({ "id": queued.id, "result": "pong" }));
        transport.collect_tick().await;
        assert_eq!(queued_rx.await.unwrap().unwrap(), json!("pong"));
        assert!(transport.last_heartbeat().await.is_some());
    }

    #[tokio::test]
    async fn test_keep_alive_sends_heartbeat_when_idle() {
        let dir = TempDir::new().unwrap();
        let mut config = BridgeConfig::with_base_dir(dir.path());
        config.keep_alive = true;
        let transport = Transport::new(&config);

        transport.submit_tick().await;
        let raw = fs::read(transport.channel().command_path()).unwrap();
        let wire: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(wire["command"], json!("ping"));
        assert_eq!(
            transport.pending().await.unwrap().command,
            CommandName::Ping
        );
    }

    #[tokio::test]
    async fn test_idle_submit_tick_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir);

        transport.submit_tick().await;
        assert!(!transport.channel().command_exists());
    }

    #[tokio::test]
    async fn test_failed_write_frees_slot() {
        let dir = TempDir::new().unwrap();
        let mut config = BridgeConfig::with_base_dir(dir.path().join("missing"));
        config.keep_alive = false;
        let transport = Transport::new(&config);

        let rx = transport
            .dispatch(balance(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(rx.await.unwrap(), Err(BridgeError::Io(_))));
        assert!(transport.pending().await.is_none());
    }

    #[tokio::test]
    async fn test_clear_pending_and_drain_queue() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir);

        let rx = transport
            .dispatch(balance(), Duration::from_secs(5))
            .await
            .unwrap();
        let queued_rx = transport.enqueue(balance(), Duration::from_secs(5)).await;

        let cleared = transport.clear_pending().await.unwrap();
        assert_eq!(cleared.command, CommandName::GetBalance);
        assert!(!transport.channel().command_exists());
        assert!(matches!(rx.await.unwrap(), Err(BridgeError::Cleared(_))));

        assert_eq!(transport.drain_queue().await, 1);
        assert!(matches!(queued_rx.await.unwrap(), Err(BridgeError::Stopped)));
    }

    #[tokio::test]
    async fn test_reset_clears_previous_run() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir);
        transport.channel().write_command(b"{}").unwrap();
        respond(&transport, json!({ "id": "crashed-run", "result": 1 }));

        assert_eq!(transport.reset().await.unwrap(), 2);
        assert!(!transport.channel().command_exists());
        assert!(!transport.channel().response_path().exists());
    }
}
