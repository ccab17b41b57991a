//! Per-peer transport tasks.
//!
//! Each remote peer has one Output Flusher that owns the outbound TCP link
//! to it. The listener accepts inbound links and runs a Reply Reader per
//! connection. A link carries frames in one direction only: the dialer
//! writes, the acceptor reads.
//!
//! Transport errors stay here. They are logged, the link is dropped, and
//! the flusher dials again with jittered exponential backoff.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use paxlog_consensus::instrumentation::METRICS;
use paxlog_consensus::{LinkState, Message};
use paxlog_types::PeerId;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::group::{PeerLinks, ProposerEvent};
use crate::shutdown::Shutdown;
use crate::wire::{self, WireMessage};
use crate::WireError;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How long a dialer has to introduce itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub(crate) struct LinkConfig {
    pub(crate) flush_batch: usize,
    pub(crate) reconnect_min: Duration,
    pub(crate) reconnect_max: Duration,
}

// ============================================================================
// Output Flusher
// ============================================================================

pub(crate) struct Flusher {
    pub(crate) local: PeerId,
    pub(crate) peer: PeerId,
    pub(crate) address: String,
    pub(crate) queue: mpsc::Receiver<Message>,
    pub(crate) redial: mpsc::Receiver<Instant>,
    pub(crate) events: mpsc::Sender<ProposerEvent>,
    pub(crate) config: LinkConfig,
    pub(crate) shutdown: Shutdown,
}

enum LinkExit {
    Shutdown,
    Redial(&'static str),
    Failed(WireError),
}

impl Flusher {
    pub(crate) async fn run(mut self) {
        let mut rng = SmallRng::from_entropy();
        let mut delay = self.config.reconnect_min;

        loop {
            let connected = tokio::select! {
                () = self.shutdown.wait() => return,
                res = TcpStream::connect(&self.address) => res,
            };
            let stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    let dropped = self.drain();
                    let wait = jittered(delay, &mut rng);
                    debug!(
                        peer = %self.peer,
                        address = %self.address,
                        error = %e,
                        dropped,
                        retry_in_ms = wait.as_millis() as u64,
                        "dial failed"
                    );
                    tokio::select! {
                        () = self.shutdown.wait() => return,
                        () = tokio::time::sleep(wait) => {}
                    }
                    delay = (delay * 2).min(self.config.reconnect_max);
                    continue;
                }
            };
            delay = self.config.reconnect_min;
            let _ = stream.set_nodelay(true);

            let connected_at = Instant::now();
            METRICS.increment_reconnects();
            info!(peer = %self.peer, address = %self.address, "link up");
            if !self.publish(LinkState::Connected).await {
                return;
            }

            let exit = self.pump(stream, connected_at).await;
            if !self.publish(LinkState::Disconnected).await {
                return;
            }
            match exit {
                LinkExit::Shutdown => return,
                LinkExit::Redial(reason) => {
                    info!(peer = %self.peer, reason, "link down, redialing");
                }
                LinkExit::Failed(e) => {
                    warn!(peer = %self.peer, error = %e, "link failed, redialing");
                }
            }
        }
    }

    // Writes queued messages until the link fails or is superseded.
    async fn pump(&mut self, stream: TcpStream, connected_at: Instant) -> LinkExit {
        let (mut reader, mut writer) = stream.into_split();
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        if let Err(e) = wire::encode(&WireMessage::Hello { peer: self.local }, &mut buf) {
            return LinkExit::Failed(e);
        }
        if let Err(e) = writer.write_all(&buf).await {
            return LinkExit::Failed(e.into());
        }

        loop {
            buf.clear();
            tokio::select! {
                biased;
                () = self.shutdown.wait() => return LinkExit::Shutdown,
                closed = watch_closed(&mut reader) => return closed,
                since = self.redial.recv() => {
                    // Only a link older than the dead inbound connection is
                    // suspect. Newer ones were dialed after the peer came back.
                    match since {
                        Some(since) if connected_at < since => {
                            return LinkExit::Redial("inbound link from peer closed");
                        }
                        Some(_) => continue,
                        None => return LinkExit::Shutdown,
                    }
                }
                msg = self.queue.recv() => {
                    let Some(first) = msg else {
                        return LinkExit::Shutdown;
                    };
                    let mut count = 0u64;
                    let mut next = Some(first);
                    while let Some(msg) = next.take() {
                        match wire::encode(&WireMessage::Paxos(msg), &mut buf) {
                            Ok(()) => count += 1,
                            Err(e) => {
                                METRICS.increment_messages_dropped();
                                warn!(peer = %self.peer, error = %e, "message not encodable, dropped");
                            }
                        }
                        if count < self.config.flush_batch as u64 {
                            next = self.queue.try_recv().ok();
                        }
                    }
                    if let Err(e) = writer.write_all(&buf).await {
                        return LinkExit::Failed(e.into());
                    }
                    for _ in 0..count {
                        METRICS.increment_messages_sent();
                    }
                }
            }
        }
    }

    // Queued messages are dropped while the peer is unreachable.
    fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while self.queue.try_recv().is_ok() {
            METRICS.increment_messages_dropped();
            dropped += 1;
        }
        while self.redial.try_recv().is_ok() {}
        dropped
    }

    async fn publish(&self, state: LinkState) -> bool {
        self.events
            .send(ProposerEvent::Link {
                peer: self.peer,
                state,
            })
            .await
            .is_ok()
    }
}

// The remote never writes on our outbound link, so any read completing
// means it was closed.
async fn watch_closed(reader: &mut OwnedReadHalf) -> LinkExit {
    let mut scratch = [0u8; 64];
    match reader.read(&mut scratch).await {
        Ok(0) => LinkExit::Redial("peer closed the link"),
        Ok(_) => LinkExit::Redial("unexpected data on outbound link"),
        Err(e) => LinkExit::Failed(e.into()),
    }
}

/// `delay` plus up to half of it again.
fn jittered(delay: Duration, rng: &mut SmallRng) -> Duration {
    let half = delay.as_millis() as u64 / 2;
    delay + Duration::from_millis(rng.gen_range(0..=half))
}

// ============================================================================
// Listener and Reply Reader
// ============================================================================

pub(crate) async fn listen(listener: TcpListener, links: PeerLinks, shutdown: Shutdown) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.wait() => return,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, addr)) => {
                let _ = stream.set_nodelay(true);
                let reader = Reader {
                    links: links.clone(),
                    addr,
                    accepted_at: Instant::now(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(reader.run(stream));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

struct Reader {
    links: PeerLinks,
    addr: SocketAddr,
    accepted_at: Instant,
    shutdown: Shutdown,
}

impl Reader {
    async fn run(self, mut stream: TcpStream) {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        let hello = tokio::select! {
            () = self.shutdown.wait() => return,
            res = tokio::time::timeout(HELLO_TIMEOUT, read_frame(&mut stream, &mut buf)) => res,
        };
        let peer = match hello {
            Ok(Ok(WireMessage::Hello { peer })) => peer,
            Ok(Ok(WireMessage::Paxos(_))) => {
                warn!(addr = %self.addr, error = %WireError::MissingHello { addr: self.addr }, "dropping inbound link");
                return;
            }
            Ok(Err(e)) => {
                debug!(addr = %self.addr, error = %e, "inbound link closed before hello");
                return;
            }
            Err(_) => {
                warn!(addr = %self.addr, "no hello before timeout, dropping inbound link");
                return;
            }
        };
        if !self.links.is_remote(peer) {
            warn!(peer = %peer, addr = %self.addr, "hello from a peer outside the group, dropping inbound link");
            return;
        }
        debug!(peer = %peer, addr = %self.addr, "inbound link accepted");

        let result = tokio::select! {
            () = self.shutdown.wait() => return,
            res = self.read_loop(peer, &mut stream, &mut buf) => res,
        };
        match result {
            Err(WireError::ConnectionClosed) => {
                info!(peer = %peer, "inbound link closed");
            }
            Err(e @ (WireError::Checksum { .. } | WireError::BadMagic { .. })) => {
                METRICS.increment_checksum_failures();
                warn!(peer = %peer, error = %e, "corrupt frame, dropping inbound link");
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "inbound link failed");
            }
            Ok(()) => {}
        }
        self.links.request_redial(peer, self.accepted_at);
    }

    async fn read_loop(
        &self,
        peer: PeerId,
        stream: &mut TcpStream,
        buf: &mut BytesMut,
    ) -> Result<(), WireError> {
        let local = self.links.local();
        loop {
            match read_frame(stream, buf).await? {
                WireMessage::Paxos(msg) => {
                    METRICS.increment_messages_received();
                    if msg.from != peer || !msg.is_for(local) {
                        debug!(
                            peer = %peer,
                            from = %msg.from,
                            kind = msg.payload.name(),
                            "misaddressed message ignored"
                        );
                        continue;
                    }
                    self.links.dispatch(msg);
                }
                WireMessage::Hello { .. } => {
                    debug!(peer = %peer, "repeated hello ignored");
                }
            }
        }
    }
}

async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<WireMessage, WireError> {
    loop {
        if let Some(msg) = wire::decode(buf)? {
            return Ok(msg);
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(WireError::ConnectionClosed);
        }
    }
}
