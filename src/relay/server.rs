//! Server core: listener, accept loop, per-peer workers
//!
//! Accepts a fixed number of sender connections and runs one strictly
//! sequential worker per accepted socket: read a framed request, hand the
//! payload to the user callback, write the ack. Workers never validate the
//! request seqno; ordering is the sender's invariant.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::shutdown::Shutdown;
use super::types::{ReadyNotifier, RemoteMessageCallback, SiteId};
use super::wire::{self, Response};
use super::RelayError;

/// Listen backlog, sized for a fixed set of senders joining at startup.
const LISTEN_BACKLOG: i32 = 5;

pub struct RemoteMessageService {
    local_site_id: SiteId,
    num_senders: usize,
    max_payload_size: u64,
    listener: TcpListener,
    local_addr: SocketAddr,
    rmc: RemoteMessageCallback,
    ready_notifier: ReadyNotifier,
    server_ready: Arc<AtomicBool>,
    shutdown: Arc<Shutdown>,
}

impl RemoteMessageService {
    /// Bind `0.0.0.0:local_port` with address reuse and store the listening
    /// socket. Accepting starts only when [`accept_loop`] is spawned.
    ///
    /// [`accept_loop`]: RemoteMessageService::accept_loop
    pub fn new(
        local_site_id: SiteId,
        num_senders: usize,
        local_port: u16,
        max_payload_size: u64,
        rmc: RemoteMessageCallback,
        ready_notifier: ReadyNotifier,
        shutdown: Arc<Shutdown>,
    ) -> Result<Self, RelayError> {
        let listener = bind_listener(local_port)
            .map_err(|source| RelayError::Bind { port: local_port, source })?;
        let local_addr = listener.local_addr()?;
        info!("remote message service listening on {}", local_addr);

        Ok(Self {
            local_site_id,
            num_senders,
            max_payload_size,
            listener,
            local_addr,
            rmc,
            ready_notifier,
            server_ready: Arc::new(AtomicBool::new(false)),
            shutdown,
        })
    }

    /// Actual bound address; relevant when `local_port` was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared readiness flag, set after the last sender has connected.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.server_ready)
    }

    pub fn is_ready(&self) -> bool {
        self.server_ready.load(Ordering::Acquire)
    }

    /// Accept exactly `num_senders` connections, one worker task each, then
    /// report ready. Dynamic join is not supported: later connection
    /// attempts stay in the listen queue until the service is dropped.
    /// Parks until shutdown and then joins the workers.
    pub async fn accept_loop(self) -> Result<(), RelayError> {
        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(self.num_senders);

        while workers.len() < self.num_senders {
            let (stream, peer_addr) = tokio::select! {
                _ = self.shutdown.triggered() => {
                    debug!("accept loop exiting on shutdown");
                    break;
                }
                accepted = self.listener.accept() => accepted?,
            };
            info!("accepted sender connection from {}", peer_addr);

            let worker = Worker {
                stream,
                peer_addr,
                local_site_id: self.local_site_id,
                max_payload_size: self.max_payload_size,
                rmc: Arc::clone(&self.rmc),
                shutdown: Arc::clone(&self.shutdown),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        if workers.len() == self.num_senders {
            self.server_ready.store(true, Ordering::Release);
            (self.ready_notifier)();
            info!("all {} sender connections established", self.num_senders);
        }

        self.shutdown.triggered().await;
        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }
}

/// One accepted sender connection, serviced strictly sequentially.
struct Worker {
    stream: TcpStream,
    peer_addr: SocketAddr,
    local_site_id: SiteId,
    max_payload_size: u64,
    rmc: RemoteMessageCallback,
    shutdown: Arc<Shutdown>,
}

impl Worker {
    async fn run(mut self) {
        // Scratch buffer reused across requests; payloads are bounded by
        // max_payload_size, so one allocation serves the whole session.
        let mut scratch = vec![0u8; self.max_payload_size as usize];
        debug!("worker for {} starting", self.peer_addr);

        loop {
            let served = tokio::select! {
                _ = self.shutdown.triggered() => break,
                served = serve_one(
                    &mut self.stream,
                    &mut scratch,
                    self.local_site_id,
                    self.max_payload_size,
                    &self.rmc,
                ) => served,
            };

            match served {
                Ok(()) => {}
                Err(RelayError::Io(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    debug!("sender {} disconnected", self.peer_addr);
                    break;
                }
                Err(err) => {
                    warn!("terminating session with {}: {}", self.peer_addr, err);
                    break;
                }
            }
        }
    }
}

/// Serve a single request: header, payload, user callback, ack. Any
/// failure, including an oversize payload declaration, ends the session.
async fn serve_one(
    stream: &mut TcpStream,
    scratch: &mut [u8],
    local_site_id: SiteId,
    max_payload_size: u64,
    rmc: &RemoteMessageCallback,
) -> Result<(), RelayError> {
    let header = wire::read_request_header(stream).await?;
    if header.payload_size > max_payload_size {
        return Err(RelayError::PayloadTooLarge {
            size: header.payload_size,
            max: max_payload_size,
        });
    }

    let payload = &mut scratch[..header.payload_size as usize];
    stream.read_exact(payload).await?;
    debug!("received msg {} from site {}", header.seq, header.site_id);

    // The callback runs to completion before the ack goes out; delivery is
    // acknowledged only after the application has seen the payload.
    rmc(header.site_id, payload);

    wire::write_response(stream, &Response { seq: header.seq, site_id: local_site_id }).await?;
    Ok(())
}

/// Plain blocking-free listener with address reuse and a short backlog,
/// handed over to tokio once configured.
fn bind_listener(local_port: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], local_port)).into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}
