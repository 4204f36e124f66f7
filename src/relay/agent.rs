//! Lifecycle facades
//!
//! [`WanAgentServer`] and [`WanAgentSender`] own every long-running task of
//! their core and join them on shutdown; nothing is detached. A fault in
//! any loop is recorded, triggers shutdown of the whole core, and is
//! surfaced by `shutdown_and_wait`.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};
use tracing::{debug, error};

use crate::config::WanConfig;

use super::counters::AckCounters;
use super::sender::{MessageSender, SenderStats};
use super::server::RemoteMessageService;
use super::shutdown::Shutdown;
use super::types::{PredicateFn, ReadyNotifier, RemoteMessageCallback, ReportAckFn, SiteId};
use super::RelayError;

/// First fault recorded by any loop of a core.
type FaultSlot = Arc<Mutex<Option<RelayError>>>;

/// Run a core loop to completion; on error, record it (first wins) and
/// bring the whole core down.
fn spawn_guarded<F>(
    name: &'static str,
    task: F,
    fault: FaultSlot,
    shutdown: Arc<Shutdown>,
) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = Result<(), RelayError>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = task.await {
            error!("{} failed: {}", name, err);
            fault.lock().unwrap().get_or_insert(err);
            shutdown.trigger();
        }
    })
}

fn take_fault(fault: &FaultSlot) -> Result<(), RelayError> {
    match fault.lock().unwrap().take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Wait until `ready` turns true; false if the core went down first.
async fn await_ready(ready: &watch::Receiver<bool>, shutdown: &Shutdown) -> bool {
    let mut ready = ready.clone();
    loop {
        if *ready.borrow_and_update() {
            return true;
        }
        tokio::select! {
            changed = ready.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            _ = shutdown.triggered() => return false,
        }
    }
}

fn watch_notifier() -> (ReadyNotifier, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    let notifier: ReadyNotifier = Arc::new(move || {
        let _ = tx.send(true);
    });
    (notifier, rx)
}

// =============================================================================
// SERVER FACADE
// =============================================================================

/// Server-side agent: accepts the configured senders and dispatches every
/// received payload to the user callback.
pub struct WanAgentServer {
    local_addr: SocketAddr,
    server_ready: Arc<AtomicBool>,
    ready: watch::Receiver<bool>,
    shutdown: Arc<Shutdown>,
    fault: FaultSlot,
    accept_task: Option<tokio::task::JoinHandle<()>>,
}

impl WanAgentServer {
    pub fn new(config: &WanConfig, rmc: RemoteMessageCallback) -> Result<Self, RelayError> {
        config.validate()?;

        let shutdown = Shutdown::new();
        let fault: FaultSlot = Arc::new(Mutex::new(None));
        let (notifier, ready) = watch_notifier();

        let service = RemoteMessageService::new(
            config.local_site_id,
            config.num_senders(),
            config.private_port,
            config.max_payload_size,
            rmc,
            notifier,
            Arc::clone(&shutdown),
        )?;
        let local_addr = service.local_addr();
        let server_ready = service.ready_flag();

        let accept_task = spawn_guarded(
            "accept loop",
            service.accept_loop(),
            Arc::clone(&fault),
            Arc::clone(&shutdown),
        );

        Ok(Self {
            local_addr,
            server_ready,
            ready,
            shutdown,
            fault,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_ready(&self) -> bool {
        self.server_ready.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Wait until every configured sender has connected; false if the
    /// server failed or was shut down first.
    pub async fn wait_ready(&self) -> bool {
        await_ready(&self.ready, &self.shutdown).await
    }

    /// Stop accepting, join the workers, and surface the first fault.
    /// Idempotent.
    pub async fn shutdown_and_wait(&mut self) -> Result<(), RelayError> {
        self.shutdown.trigger();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        take_fault(&self.fault)
    }
}

// =============================================================================
// SENDER FACADE
// =============================================================================

/// Flag-plus-notify pair the ack loop raises and the predicate loop waits
/// on; repeated acks between predicate wake-ups coalesce into one flag.
struct AckSignal {
    has_new_ack: Mutex<bool>,
    notify: Notify,
}

impl AckSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self { has_new_ack: Mutex::new(false), notify: Notify::new() })
    }

    fn raise(&self) {
        *self.has_new_ack.lock().unwrap() = true;
        self.notify.notify_one();
    }

    fn clear(&self) {
        *self.has_new_ack.lock().unwrap() = false;
    }

    async fn wait_raised(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if *self.has_new_ack.lock().unwrap() {
                return;
            }
            notified.await;
        }
    }
}

/// Sender-side agent: the producer API, progress observation, and the
/// predicate loop driving the user's stability logic.
pub struct WanAgentSender {
    sender: MessageSender,
    counters: Arc<AckCounters>,
    signal: Arc<AckSignal>,
    ready: watch::Receiver<bool>,
    shutdown: Arc<Shutdown>,
    fault: FaultSlot,
    tasks: Option<[tokio::task::JoinHandle<()>; 3]>,
}

impl WanAgentSender {
    /// Connect to every configured server site and start the send,
    /// ack-receive, and predicate loops. Fatal if any peer is unreachable.
    pub async fn new(config: &WanConfig, predicate: PredicateFn) -> Result<Self, RelayError> {
        config.validate()?;
        let server_sites = config.remote_server_sites()?;

        let shutdown = Shutdown::new();
        let fault: FaultSlot = Arc::new(Mutex::new(None));
        let (notifier, ready) = watch_notifier();
        let signal = AckSignal::new();
        let counters = Arc::new(AckCounters::new(server_sites.keys().copied()));

        let report_new_ack: ReportAckFn = {
            let signal = Arc::clone(&signal);
            Arc::new(move || signal.raise())
        };

        let (sender, send_loop, ack_loop) = MessageSender::connect(
            config.local_site_id,
            &server_sites,
            config.window_size,
            config.max_payload_size,
            Arc::clone(&counters),
            report_new_ack,
            notifier,
            Arc::clone(&shutdown),
        )
        .await?;

        let send_task = spawn_guarded(
            "send loop",
            send_loop.run(),
            Arc::clone(&fault),
            Arc::clone(&shutdown),
        );
        let ack_task = spawn_guarded(
            "ack loop",
            ack_loop.run(),
            Arc::clone(&fault),
            Arc::clone(&shutdown),
        );
        let predicate_task = tokio::spawn(predicate_loop(
            Arc::clone(&signal),
            Arc::clone(&counters),
            predicate,
            Arc::clone(&shutdown),
        ));

        Ok(Self {
            sender,
            counters,
            signal,
            ready,
            shutdown,
            fault,
            tasks: Some([send_task, ack_task, predicate_task]),
        })
    }

    /// Hand one payload to the relay. Rejected if it exceeds the configured
    /// maximum payload size.
    pub fn enqueue(&self, payload: &[u8]) -> Result<(), RelayError> {
        self.sender.enqueue(payload)
    }

    /// Snapshot of the per-site ack counters.
    pub fn get_message_counters(&self) -> HashMap<SiteId, u64> {
        self.counters.snapshot()
    }

    pub fn stats(&self) -> SenderStats {
        self.sender.stats()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }

    pub async fn wait_ready(&self) -> bool {
        await_ready(&self.ready, &self.shutdown).await
    }

    /// Signal every loop, wake the predicate once more so it can observe
    /// the flag, join all three tasks, and surface the first fault.
    /// Idempotent; the send buffer is drained best-effort only.
    pub async fn shutdown_and_wait(&mut self) -> Result<(), RelayError> {
        self.shutdown.trigger();
        self.signal.raise();
        if let Some(tasks) = self.tasks.take() {
            for task in tasks {
                let _ = task.await;
            }
        }
        take_fault(&self.fault)
    }
}

/// Wait for new acks, snapshot the counters, hand the snapshot to the user
/// predicate. Repeated invocations with an identical snapshot are possible;
/// a strictly newer snapshot follows every counted ack.
async fn predicate_loop(
    signal: Arc<AckSignal>,
    counters: Arc<AckCounters>,
    predicate: PredicateFn,
    shutdown: Arc<Shutdown>,
) {
    while !shutdown.is_triggered() {
        // Wake on new acks, but also on shutdown directly: a fault guard
        // only triggers the shutdown signal, and no further ack may ever
        // arrive to raise the flag.
        tokio::select! {
            _ = signal.wait_raised() => {}
            _ = shutdown.triggered() => break,
        }
        if shutdown.is_triggered() {
            break;
        }
        // Clear before snapshotting: an ack landing in between re-raises
        // the signal, so its count is picked up on the next pass instead of
        // being lost.
        signal.clear();
        let snapshot = counters.snapshot();
        predicate(&snapshot);
    }
    debug!("predicate loop exiting on shutdown");
}
