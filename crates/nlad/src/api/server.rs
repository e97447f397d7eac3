//! Cluster API server (master role)
//!
//! Accepts slaves forwarding their local envelopes and subscribers reading
//! the merged stream. Each connection runs in its own task; the subscriber
//! set and the slave table are the only shared state.

use crate::api::nodes::NodeTable;
use crate::api::protocol::{
    framed, recv_frame, send_frame_within, Frame, Hello, PeerRole, SessionTimeouts, SubscribeFilter,
};
use crate::api::subscriber::{SubscriberSet, Subscription};
use crate::error::{NladError, Result};
use crate::metrics::NladMetrics;
use crate::service::NlaChannels;
use futures::StreamExt;
use nla_msg::opcode::{RTM_DELNODE, RTM_NEWNODE};
use nla_msg::{Envelope, Group, Node, NodeId, Payload, Source};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Modify frames queued per slave before they are dropped
const SLAVE_MODIFY_BUFFER: usize = 1024;

struct Shared {
    nid: NodeId,
    channels: NlaChannels,
    subscribers: Arc<SubscriberSet>,
    nodes: Arc<NodeTable>,
    metrics: NladMetrics,
    timeouts: SessionTimeouts,
}

impl Shared {
    async fn send(&self, sink: &mut FrameSink, frame: &Frame, shutdown: &CancellationToken) -> Result<()> {
        send_frame_within(sink, frame, self.timeouts.write, shutdown).await
    }

    /// Queues an envelope for the local manager unless shutdown comes first.
    async fn submit(&self, envelope: Envelope, shutdown: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = shutdown.cancelled() => Err(NladError::Shutdown),
            result = self.channels.send_api(envelope) => result,
        }
    }
}

pub struct ApiServer {
    listeners: Vec<TcpListener>,
    shared: Shared,
}

impl ApiServer {
    /// Binds every address. Any bind failure is returned and is fatal for the master.
    pub async fn bind(
        addrs: &[String],
        nid: NodeId,
        channels: NlaChannels,
        subscribers: Arc<SubscriberSet>,
        metrics: NladMetrics,
    ) -> Result<Self> {
        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                NladError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to bind cluster API on {}: {}", addr, e),
                ))
            })?;
            info!(address = %addr, "Cluster API listening");
            listeners.push(listener);
        }

        Ok(Self {
            listeners,
            shared: Shared {
                nid,
                channels,
                subscribers,
                nodes: Arc::new(NodeTable::new()),
                metrics,
                timeouts: SessionTimeouts::default(),
            },
        })
    }

    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.shared.timeouts = timeouts;
        self
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    pub fn nodes(&self) -> Arc<NodeTable> {
        Arc::clone(&self.shared.nodes)
    }

    /// Runs one accept loop per listener until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let shared = Arc::new(self.shared);
        let mut loops = Vec::with_capacity(self.listeners.len());
        for listener in self.listeners {
            let shared = Arc::clone(&shared);
            let shutdown = shutdown.clone();
            loops.push(tokio::spawn(accept_loop(listener, shared, shutdown)));
        }

        for handle in loops {
            let _ = handle.await;
        }
        info!("Cluster API stopped");
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let shared = Arc::clone(&shared);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, shared, shutdown).await {
                            debug!(peer = %peer, error = %e, "Connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    // Transient accept errors - log and continue
                    warn!(error = %e, "Accept error");
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (mut sink, mut frames) = framed(stream).split();

    let first = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        first = tokio::time::timeout(shared.timeouts.handshake, recv_frame(&mut frames)) => first,
    };
    let hello = match first {
        Ok(Ok(Some(Frame::Hello(hello)))) => hello,
        Ok(Ok(Some(other))) => {
            let message = format!("expected hello, got {}", other.name());
            shared.send(&mut sink, &Frame::Error { message: message.clone() }, &shutdown).await?;
            return Err(NladError::Protocol(message));
        }
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(NladError::Timeout("hello")),
    };

    match hello.role {
        PeerRole::Slave => serve_slave(hello, peer.ip(), sink, frames, shared, shutdown).await,
        PeerRole::Subscriber => serve_subscriber(hello, peer, sink, frames, shared, shutdown).await,
    }
}

type FrameSink = futures::stream::SplitSink<
    tokio_util::codec::Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
    bytes::Bytes,
>;
type FrameStream = futures::stream::SplitStream<
    tokio_util::codec::Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
>;

fn node_envelope(msg_type: u16, nid: NodeId, ip: IpAddr) -> Result<Envelope> {
    Ok(Envelope::new(msg_type, nid, Source::Api, Payload::Node(Node { ip }))?)
}

async fn serve_slave(
    hello: Hello,
    ip: IpAddr,
    mut sink: FrameSink,
    mut frames: FrameStream,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) -> Result<()> {
    let nid = hello.nid;
    if nid.is_master() || nid.is_all() {
        let message = format!("nid {} cannot connect as a slave", nid);
        shared.send(&mut sink, &Frame::Error { message: message.clone() }, &shutdown).await?;
        return Err(NladError::Protocol(message));
    }

    let (modify_tx, mut modify_rx) = mpsc::channel::<Envelope>(SLAVE_MODIFY_BUFFER);
    if let Err(e) = shared.nodes.insert(nid, ip, modify_tx) {
        warn!(nid = %nid, ip = %ip, "Slave rejected: already connected");
        shared.send(&mut sink, &Frame::Error { message: e.to_string() }, &shutdown).await?;
        return Err(e);
    }
    shared.metrics.api_slaves.set(shared.nodes.len() as i64);

    info!(nid = %nid, ip = %ip, "Slave connected");
    let result = slave_session(nid, ip, &mut sink, &mut frames, &mut modify_rx, &shared, &shutdown).await;
    drop(sink);
    drop(frames);

    // DELNODE is queued while the nid is still held, so a reconnecting
    // slave's NEWNODE always follows it.
    match node_envelope(RTM_DELNODE, nid, ip) {
        Ok(envelope) => {
            if let Err(e) = shared.channels.send_api(envelope).await {
                warn!(nid = %nid, error = %e, "Node removal not delivered");
            }
        }
        Err(e) => warn!(nid = %nid, error = %e, "Node removal not built"),
    }

    shared.nodes.remove(nid);
    shared.metrics.api_slaves.set(shared.nodes.len() as i64);
    match &result {
        Ok(()) => info!(nid = %nid, ip = %ip, "Slave disconnected"),
        Err(e) => info!(nid = %nid, ip = %ip, error = %e, "Slave disconnected"),
    }

    result
}

async fn slave_session(
    nid: NodeId,
    ip: IpAddr,
    sink: &mut FrameSink,
    frames: &mut FrameStream,
    modify_rx: &mut mpsc::Receiver<Envelope>,
    shared: &Shared,
    shutdown: &CancellationToken,
) -> Result<()> {
    shared.send(sink, &Frame::Welcome { master_nid: shared.nid }, shutdown).await?;
    shared.submit(node_envelope(RTM_NEWNODE, nid, ip)?, shutdown).await?;

    let idle = tokio::time::sleep(shared.timeouts.idle);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = &mut idle => {
                warn!(nid = %nid, ip = %ip, idle = ?shared.timeouts.idle, "Slave silent, dropping");
                return Err(NladError::Timeout("slave idle"));
            }
            frame = recv_frame(frames) => {
                idle.as_mut().reset(Instant::now() + shared.timeouts.idle);
                match frame {
                    Ok(Some(Frame::Submit(envelope))) => {
                        if envelope.nid() != nid {
                            warn!(nid = %nid, envelope = %envelope, "Submit for another node ignored");
                            continue;
                        }
                        let seq = envelope.seq();
                        shared.submit(envelope, shutdown).await?;
                        shared.metrics.api_submitted_total.inc();
                        shared.send(sink, &Frame::Ack { seq }, shutdown).await?;
                    }
                    Ok(Some(Frame::Ping)) => shared.send(sink, &Frame::Pong, shutdown).await?,
                    Ok(Some(other)) => {
                        debug!(nid = %nid, frame = other.name(), "Unexpected frame from slave");
                    }
                    Ok(None) => return Ok(()),
                    Err(NladError::Io(e)) => return Err(NladError::Io(e)),
                    Err(e) => {
                        warn!(nid = %nid, error = %e, "Malformed frame from slave skipped");
                    }
                }
            }
            Some(envelope) = modify_rx.recv() => {
                shared.send(sink, &Frame::Modify(envelope), shutdown).await?;
            }
        }
    }
}

async fn serve_subscriber(
    hello: Hello,
    peer: SocketAddr,
    mut sink: FrameSink,
    mut frames: FrameStream,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) -> Result<()> {
    let filter: SubscribeFilter = hello.filter;
    let subscription = match shared.subscribers.subscribe(filter) {
        Ok(subscription) => subscription,
        Err(e) => {
            shared.send(&mut sink, &Frame::Error { message: e.to_string() }, &shutdown).await?;
            return Err(e);
        }
    };
    let id = subscription.id;
    info!(id, peer = %peer, nid = %hello.nid, stored = subscription.snapshot.len(), "Subscriber connected");

    let result = subscriber_session(subscription, &mut sink, &mut frames, &shared, &shutdown).await;

    shared.subscribers.unsubscribe(id);
    match &result {
        Ok(()) => info!(id, peer = %peer, "Subscriber disconnected"),
        Err(e) => info!(id, peer = %peer, error = %e, "Subscriber disconnected"),
    }
    result
}

async fn subscriber_session(
    subscription: Subscription,
    sink: &mut FrameSink,
    frames: &mut FrameStream,
    shared: &Shared,
    shutdown: &CancellationToken,
) -> Result<()> {
    let id = subscription.id;
    let mut events = subscription.events;

    shared.send(sink, &Frame::Welcome { master_nid: shared.nid }, shutdown).await?;
    for envelope in subscription.snapshot {
        shared.send(sink, &Frame::Event(envelope), shutdown).await?;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            event = events.recv() => match event {
                Some(envelope) => {
                    shared.send(sink, &Frame::Event(envelope.as_ref().clone()), shutdown).await?
                }
                None => {
                    warn!(id, "Subscriber dropped after sustained overflow");
                    return Ok(());
                }
            },
            frame = recv_frame(frames) => match frame {
                Ok(Some(Frame::Modify(envelope))) => route_modify(envelope, shared, shutdown).await?,
                Ok(Some(Frame::Ping)) => shared.send(sink, &Frame::Pong, shutdown).await?,
                Ok(Some(other)) => debug!(id, frame = other.name(), "Unexpected frame from subscriber"),
                Ok(None) => return Ok(()),
                Err(NladError::Io(e)) => return Err(NladError::Io(e)),
                Err(e) => warn!(id, error = %e, "Malformed frame from subscriber skipped"),
            }
        }
    }
}

/// Routes a modification: VPN entries and anything aimed at the master (or
/// every node) enter the master's API queue; anything aimed at a slave (or
/// every node) goes down that slave's connection.
async fn route_modify(envelope: Envelope, shared: &Shared, shutdown: &CancellationToken) -> Result<()> {
    let target = envelope.nid();
    let envelope = envelope.with_source(Source::Api);

    let to_master = envelope.group() == Group::Vpn || target == shared.nid || target.is_all();
    if to_master {
        shared.submit(envelope.clone(), shutdown).await?;
    }

    if target != shared.nid {
        let delivered = shared.nodes.route(&envelope);
        if delivered == 0 && !to_master {
            warn!(nid = %target, envelope = %envelope, "Modify for unknown node dropped");
        }
    }
    Ok(())
}
