//! Sender core: outbound connections, send loop, ack-receive loop
//!
//! One persistent TCP connection per server site. Each stream is split
//! once at connect time: the write halves belong to the send loop and the
//! read halves to the ack-receive loop, so the two directions are polled
//! independently and a slow outbound socket never delays ack processing.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::select_all;
use futures::FutureExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, trace};

use super::buffer::{BufferNode, SendBuffer};
use super::counters::AckCounters;
use super::shutdown::Shutdown;
use super::types::{ReadyNotifier, ReportAckFn, SeqNo, SiteId};
use super::wire::{self, RequestHeader};
use super::RelayError;

/// Point-in-time view of the sender's progress.
#[derive(Debug, Clone)]
pub struct SenderStats {
    /// Messages still in the buffer, i.e. not yet sent to every peer.
    pub pending: usize,
    /// Highest seqno sent to all peers (the global frontier).
    pub last_all_sent: SeqNo,
    /// Per-site ack counters.
    pub message_counters: std::collections::HashMap<SiteId, u64>,
}

struct SendPeer {
    site_id: SiteId,
    writer: OwnedWriteHalf,
    last_sent: SeqNo,
}

struct AckPeer {
    site_id: SiteId,
    reader: OwnedReadHalf,
}

/// Handle side of the sender core: the producer API plus observation.
/// The loops themselves run as separate tasks built by [`MessageSender::connect`].
pub struct MessageSender {
    max_payload_size: u64,
    buffer: Arc<Mutex<SendBuffer>>,
    not_empty: Arc<Notify>,
    frontier: Arc<AtomicU64>,
    counters: Arc<AckCounters>,
}

impl MessageSender {
    /// Open one connection per remote server site and assemble the two
    /// loops. Failure to reach any configured peer is fatal; streams opened
    /// so far are dropped and closed on the error path.
    pub async fn connect(
        local_site_id: SiteId,
        server_sites: &BTreeMap<SiteId, SocketAddr>,
        window_size: u64,
        max_payload_size: u64,
        counters: Arc<AckCounters>,
        report_new_ack: ReportAckFn,
        ready_notifier: ReadyNotifier,
        shutdown: Arc<Shutdown>,
    ) -> Result<(Self, SendLoop, AckLoop), RelayError> {
        let mut send_peers = Vec::with_capacity(server_sites.len());
        let mut ack_peers = Vec::with_capacity(server_sites.len());

        for (&site_id, &addr) in server_sites {
            if site_id == local_site_id {
                continue;
            }
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|source| RelayError::Connect { site_id, addr, source })?;
            info!("connected to server site {} at {}", site_id, addr);

            let (reader, writer) = stream.into_split();
            send_peers.push(SendPeer { site_id, writer, last_sent: SeqNo::NeverSent });
            ack_peers.push(AckPeer { site_id, reader });
        }
        if send_peers.is_empty() {
            return Err(crate::config::ConfigError::NoRemotePeers.into());
        }

        let buffer = Arc::new(Mutex::new(SendBuffer::with_window(window_size)));
        let not_empty = Arc::new(Notify::new());
        let frontier = Arc::new(AtomicU64::new(SeqNo::NeverSent.to_raw()));

        let sender = MessageSender {
            max_payload_size,
            buffer: Arc::clone(&buffer),
            not_empty: Arc::clone(&not_empty),
            frontier: Arc::clone(&frontier),
            counters: Arc::clone(&counters),
        };
        let send_loop = SendLoop {
            local_site_id,
            peers: send_peers,
            buffer,
            not_empty,
            frontier,
            shutdown: Arc::clone(&shutdown),
        };
        let ack_loop = AckLoop {
            peers: ack_peers,
            counters,
            report_new_ack,
            shutdown,
        };

        ready_notifier();
        Ok((sender, send_loop, ack_loop))
    }

    /// Copy `payload` into a fresh buffer node, append it, and wake the
    /// send loop. Thread-safe with respect to itself and the send loop.
    pub fn enqueue(&self, payload: &[u8]) -> Result<(), RelayError> {
        if payload.len() as u64 > self.max_payload_size {
            return Err(RelayError::PayloadTooLarge {
                size: payload.len() as u64,
                max: self.max_payload_size,
            });
        }
        self.buffer.lock().unwrap().push(BufferNode::copy_from(payload));
        self.not_empty.notify_one();
        Ok(())
    }

    /// Highest seqno that has been sent to every peer.
    pub fn last_all_sent(&self) -> SeqNo {
        SeqNo::from_raw(self.frontier.load(Ordering::Acquire))
    }

    /// Messages not yet sent to every peer.
    pub fn pending(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            pending: self.pending(),
            last_all_sent: self.last_all_sent(),
            message_counters: self.counters.snapshot(),
        }
    }
}

/// The multiplexed fan-out loop. Owns the write halves and all per-peer
/// `last_sent` positions; nothing else touches them.
pub struct SendLoop {
    local_site_id: SiteId,
    peers: Vec<SendPeer>,
    buffer: Arc<Mutex<SendBuffer>>,
    not_empty: Arc<Notify>,
    frontier: Arc<AtomicU64>,
    shutdown: Arc<Shutdown>,
}

impl SendLoop {
    pub async fn run(mut self) -> Result<(), RelayError> {
        loop {
            // Step 1: park until there is something to send.
            if !self.wait_pending().await {
                debug!("send loop exiting on shutdown");
                return Ok(());
            }

            // Step 2: wait for write readiness on any subset of peers.
            let ready = tokio::select! {
                _ = self.shutdown.triggered() => {
                    debug!("send loop exiting on shutdown");
                    return Ok(());
                }
                ready = writable_peers(&self.peers) => ready?,
            };

            // Step 3: one head frame per writable peer. Only the head node
            // is ever transmitted in a single wake-up, even for a peer that
            // is several messages behind; deeper backlog drains across
            // subsequent readiness wake-ups as the frontier advance below
            // slides the head forward.
            let (head, buffered) = {
                let buffer = self.buffer.lock().unwrap();
                (buffer.front().cloned(), buffer.len() as u64)
            };
            let Some(node) = head else { continue };
            let frontier = SeqNo::from_raw(self.frontier.load(Ordering::Acquire));

            for idx in ready {
                let peer = &mut self.peers[idx];
                // A peer whose offset equals the buffer length has already
                // consumed everything currently buffered.
                if peer.last_sent.offset_from(frontier) == buffered {
                    continue;
                }
                let seq = peer.last_sent.next();
                let header = RequestHeader {
                    seq,
                    site_id: self.local_site_id,
                    payload_size: node.payload_size(),
                };
                wire::write_request(&mut peer.writer, &header, node.payload())
                    .await
                    .map_err(|source| RelayError::Connection { site_id: peer.site_id, source })?;
                trace!("sent msg {} to site {}", seq, peer.site_id);
                peer.last_sent = SeqNo::Sent(seq);
            }

            // Step 4: reclaim the head once every peer has passed it.
            self.advance_frontier();
        }
    }

    /// Wait until the buffer is non-empty. Returns false on shutdown.
    async fn wait_pending(&self) -> bool {
        loop {
            if self.shutdown.is_triggered() {
                return false;
            }
            if !self.buffer.lock().unwrap().is_empty() {
                return true;
            }
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.buffer.lock().unwrap().is_empty() {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.shutdown.triggered() => return false,
            }
        }
    }

    /// Advance `last_all_sent` when the slowest peer has moved past it and
    /// retire the head node. The slowest peer gains at most one message per
    /// wake-up, so the frontier steps by exactly one.
    fn advance_frontier(&mut self) {
        let min_sent = self
            .peers
            .iter()
            .map(|peer| peer.last_sent)
            .min()
            .unwrap_or(SeqNo::NeverSent);
        let frontier = SeqNo::from_raw(self.frontier.load(Ordering::Acquire));

        if min_sent > frontier {
            let next = frontier.next();
            debug_assert_eq!(min_sent, SeqNo::Sent(next));
            let remaining = {
                let mut buffer = self.buffer.lock().unwrap();
                buffer.pop_front();
                buffer.len()
            };
            self.frontier.store(SeqNo::Sent(next).to_raw(), Ordering::Release);
            trace!("msg {} sent to all sites, {} left in buffer", next, remaining);
        }
    }
}

/// The ack-receive loop. Owns the read halves; the per-site counters are
/// mutated here and nowhere else.
pub struct AckLoop {
    peers: Vec<AckPeer>,
    counters: Arc<AckCounters>,
    report_new_ack: ReportAckFn,
    shutdown: Arc<Shutdown>,
}

impl AckLoop {
    pub async fn run(mut self) -> Result<(), RelayError> {
        loop {
            let idx = tokio::select! {
                _ = self.shutdown.triggered() => {
                    debug!("ack loop exiting on shutdown");
                    return Ok(());
                }
                idx = readable_peer(&self.peers) => idx?,
            };

            let peer = &mut self.peers[idx];
            let response = wire::read_response(&mut peer.reader)
                .await
                .map_err(|source| RelayError::Connection { site_id: peer.site_id, source })?;
            debug!("received ack from site {} for msg {}", response.site_id, response.seq);

            self.counters.record_ack(response.site_id, response.seq)?;
            (self.report_new_ack)();
        }
    }
}

/// Resolve once at least one peer socket is writable; report every peer
/// that is ready at that moment. The write-readiness analogue of draining
/// one poller wake-up.
async fn writable_peers(peers: &[SendPeer]) -> Result<Vec<usize>, RelayError> {
    let waits = peers
        .iter()
        .enumerate()
        .map(|(idx, peer)| {
            Box::pin(async move {
                peer.writer
                    .writable()
                    .await
                    .map(|_| idx)
                    .map_err(|source| RelayError::Connection { site_id: peer.site_id, source })
            })
        })
        .collect::<Vec<_>>();

    let (first, _, rest) = select_all(waits).await;
    let mut ready = vec![first?];
    for wait in rest {
        if let Some(result) = wait.now_or_never() {
            ready.push(result?);
        }
    }
    Ok(ready)
}

/// Resolve with the index of one readable peer socket.
async fn readable_peer(peers: &[AckPeer]) -> Result<usize, RelayError> {
    let waits = peers
        .iter()
        .enumerate()
        .map(|(idx, peer)| {
            Box::pin(async move {
                peer.reader
                    .readable()
                    .await
                    .map(|_| idx)
                    .map_err(|source| RelayError::Connection { site_id: peer.site_id, source })
            })
        })
        .collect::<Vec<_>>();

    let (first, _, _) = select_all(waits).await;
    first
}
