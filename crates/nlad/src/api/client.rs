//! Cluster API clients
//!
//! [`ApiClient`] is the slave's link to the master: it dials with a fixed
//! retry interval, submits local envelopes while connected and feeds
//! modifications pushed by the master into the local API queue. Nothing is
//! buffered across reconnections. Connect, handshake and every write are
//! bounded by [`SessionTimeouts`]; a master that stays silent past the idle
//! timeout despite the client's pings is treated as gone.
//!
//! [`SubscriberClient`] reads the merged stream from the master.

use crate::api::protocol::{
    framed, recv_frame, send_frame, send_frame_within, Frame, Hello, PeerRole, SessionTimeouts,
    SubscribeFilter,
};
use crate::error::{NladError, Result};
use crate::metrics::NladMetrics;
use crate::service::NlaChannels;
use futures::StreamExt;
use nla_msg::{Envelope, NodeId, Source};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Producer side of the slave's outbound queue, used by the slave service.
#[derive(Clone, Debug)]
pub struct ForwardHandle {
    sender: mpsc::Sender<Envelope>,
    connected: Arc<AtomicBool>,
}

/// Why an envelope was not queued for the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardError {
    Disconnected,
    Full,
}

impl ForwardHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// A handle whose outbound queue is read directly by the caller.
    #[cfg(test)]
    pub(crate) fn attached(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let handle = Self {
            sender,
            connected: Arc::new(AtomicBool::new(true)),
        };
        (handle, receiver)
    }

    #[cfg(test)]
    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Queues an envelope for the master without waiting.
    pub fn forward(&self, envelope: Envelope) -> std::result::Result<(), ForwardError> {
        if !self.is_connected() {
            return Err(ForwardError::Disconnected);
        }
        self.sender.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => ForwardError::Full,
            TrySendError::Closed(_) => ForwardError::Disconnected,
        })
    }
}

pub struct ApiClient {
    nid: NodeId,
    master_addr: String,
    retry_interval: Duration,
    channels: NlaChannels,
    outbound: mpsc::Receiver<Envelope>,
    connected: Arc<AtomicBool>,
    resync: Option<mpsc::Sender<()>>,
    metrics: NladMetrics,
    timeouts: SessionTimeouts,
}

impl ApiClient {
    pub fn new(
        nid: NodeId,
        master_addr: impl Into<String>,
        retry_interval: Duration,
        queue_size: usize,
        channels: NlaChannels,
        metrics: NladMetrics,
    ) -> (Self, ForwardHandle) {
        let (sender, outbound) = mpsc::channel(queue_size);
        let connected = Arc::new(AtomicBool::new(false));
        let client = Self {
            nid,
            master_addr: master_addr.into(),
            retry_interval,
            channels,
            outbound,
            connected: Arc::clone(&connected),
            resync: None,
            metrics,
            timeouts: SessionTimeouts::default(),
        };
        (client, ForwardHandle { sender, connected })
    }

    /// Signals `resync` after every successful handshake.
    pub fn with_resync(mut self, resync: mpsc::Sender<()>) -> Self {
        self.resync = Some(resync);
        self
    }

    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Dial loop. Runs until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(nid = %self.nid, master = %self.master_addr, "Cluster API client starting");

        while !shutdown.is_cancelled() {
            let connect = tokio::time::timeout(self.timeouts.connect, TcpStream::connect(&self.master_addr));
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                connected = connect => connected,
            };

            match connected {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    match self.session(stream, &shutdown).await {
                        Ok(()) | Err(NladError::Shutdown) => {
                            info!(master = %self.master_addr, "Disconnected from master")
                        }
                        Err(e) => {
                            info!(master = %self.master_addr, error = %e, "Disconnected from master")
                        }
                    }
                    self.connected.store(false, Ordering::Release);
                }
                Ok(Err(e)) => {
                    debug!(master = %self.master_addr, error = %e, "Connect failed");
                }
                Err(_) => {
                    debug!(master = %self.master_addr, timeout = ?self.timeouts.connect, "Connect timed out");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }

        info!("Cluster API client stopped");
    }

    async fn session(&mut self, stream: TcpStream, shutdown: &CancellationToken) -> Result<()> {
        let (mut sink, mut frames) = framed(stream).split();

        let hello = Frame::Hello(Hello {
            nid: self.nid,
            role: PeerRole::Slave,
            filter: SubscribeFilter::default(),
        });
        let handshake = async {
            send_frame(&mut sink, &hello).await?;
            recv_frame(&mut frames).await
        };
        let reply = tokio::select! {
            _ = shutdown.cancelled() => return Err(NladError::Shutdown),
            reply = tokio::time::timeout(self.timeouts.handshake, handshake) => {
                reply.map_err(|_| NladError::Timeout("welcome"))??
            }
        };

        match reply {
            Some(Frame::Welcome { master_nid }) => {
                info!(nid = %self.nid, master_nid = %master_nid, master = %self.master_addr, "Connected to master");
            }
            Some(Frame::Error { message }) => return Err(NladError::Protocol(message)),
            Some(other) => {
                return Err(NladError::Protocol(format!(
                    "expected welcome, got {}",
                    other.name()
                )))
            }
            None => return Err(NladError::Protocol("closed during handshake".to_string())),
        }

        // Anything queued while disconnected is stale.
        let mut stale = 0u64;
        while self.outbound.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            self.metrics.api_forward_dropped_total.inc_by(stale);
        }

        self.connected.store(true, Ordering::Release);
        if let Some(resync) = &self.resync {
            let _ = resync.try_send(());
        }

        let write = self.timeouts.write;
        let mut heartbeat = tokio::time::interval(self.timeouts.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle = tokio::time::sleep(self.timeouts.idle);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = &mut idle => return Err(NladError::Timeout("master idle")),
                _ = heartbeat.tick() => {
                    send_frame_within(&mut sink, &Frame::Ping, write, shutdown).await?;
                }
                outbound = self.outbound.recv() => match outbound {
                    Some(envelope) => {
                        send_frame_within(&mut sink, &Frame::Submit(envelope), write, shutdown).await?
                    }
                    None => return Ok(()),
                },
                frame = recv_frame(&mut frames) => {
                    idle.as_mut().reset(Instant::now() + self.timeouts.idle);
                    match frame {
                        Ok(Some(Frame::Ack { seq })) => trace!(seq, "Ack"),
                        Ok(Some(Frame::Pong)) => trace!("Pong"),
                        Ok(Some(Frame::Modify(envelope))) => {
                            debug!(envelope = %envelope, "Modify from master");
                            let envelope = envelope.with_source(Source::Api);
                            tokio::select! {
                                _ = shutdown.cancelled() => return Ok(()),
                                result = self.channels.send_api(envelope) => result?,
                            }
                        }
                        Ok(Some(Frame::Error { message })) => {
                            warn!(error = %message, "Master reported an error")
                        }
                        Ok(Some(other)) => debug!(frame = other.name(), "Unexpected frame from master"),
                        Ok(None) => return Ok(()),
                        Err(NladError::Io(e)) => return Err(NladError::Io(e)),
                        Err(e) => warn!(error = %e, "Malformed frame from master skipped"),
                    }
                }
            }
        }
    }
}

/// Reader of the master's merged stream.
pub struct SubscriberClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    master_nid: NodeId,
}

impl SubscriberClient {
    /// Connects and completes the handshake.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        nid: NodeId,
        filter: SubscribeFilter,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let mut framed = framed(stream);

        let hello = Frame::Hello(Hello {
            nid,
            role: PeerRole::Subscriber,
            filter,
        });
        let handshake = async {
            send_frame(&mut framed, &hello).await?;
            recv_frame(&mut framed).await
        };
        let reply = tokio::time::timeout(SessionTimeouts::default().handshake, handshake)
            .await
            .map_err(|_| NladError::Timeout("welcome"))??;

        match reply {
            Some(Frame::Welcome { master_nid }) => Ok(Self { framed, master_nid }),
            Some(Frame::Error { message }) => Err(NladError::Protocol(message)),
            Some(other) => Err(NladError::Protocol(format!(
                "expected welcome, got {}",
                other.name()
            ))),
            None => Err(NladError::Protocol("closed during handshake".to_string())),
        }
    }

    pub fn master_nid(&self) -> NodeId {
        self.master_nid
    }

    /// Next envelope of the stream, `None` once the master closes it.
    pub async fn recv(&mut self) -> Result<Option<Envelope>> {
        loop {
            match recv_frame(&mut self.framed).await? {
                Some(Frame::Event(envelope)) => return Ok(Some(envelope)),
                Some(Frame::Error { message }) => return Err(NladError::Protocol(message)),
                Some(other) => trace!(frame = other.name(), "Ignoring frame"),
                None => return Ok(None),
            }
        }
    }

    /// Sends a modification to be applied on the node named by its nid.
    pub async fn modify(&mut self, envelope: Envelope) -> Result<()> {
        send_frame(&mut self.framed, &Frame::Modify(envelope)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nla_msg::opcode::RTM_NEWLINK;
    use nla_msg::{Link, Payload};

    fn env() -> Envelope {
        Envelope::new(
            RTM_NEWLINK,
            NodeId(3),
            Source::Kernel,
            Payload::Link(Link::new(4, "eth0")),
        )
        .unwrap()
    }

    fn client() -> (ApiClient, ForwardHandle) {
        let (channels, _receivers) = NlaChannels::new(4);
        ApiClient::new(
            NodeId(3),
            "127.0.0.1:1",
            Duration::from_millis(10),
            2,
            channels,
            NladMetrics::new().unwrap(),
        )
    }

    #[test]
    fn test_forward_while_disconnected() {
        let (_client, handle) = client();
        assert!(!handle.is_connected());
        assert_eq!(handle.forward(env()), Err(ForwardError::Disconnected));
    }

    #[test]
    fn test_forward_full() {
        let (client, handle) = client();
        client.connected.store(true, Ordering::Release);
        assert!(handle.forward(env()).is_ok());
        assert!(handle.forward(env()).is_ok());
        assert_eq!(handle.forward(env()), Err(ForwardError::Full));
    }

    /// A master that accepts connections and never answers them.
    async fn mute_master() -> (String, Arc<std::sync::atomic::AtomicUsize>, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });
        (addr, accepted, task)
    }

    fn client_of(addr: &str, timeouts: SessionTimeouts) -> ApiClient {
        let (channels, _receivers) = NlaChannels::new(4);
        let (client, _handle) = ApiClient::new(
            NodeId(3),
            addr,
            Duration::from_millis(10),
            2,
            channels,
            NladMetrics::new().unwrap(),
        );
        client.with_timeouts(timeouts)
    }

    #[tokio::test]
    async fn test_unanswered_hello_times_out_and_redials() {
        let (addr, accepted, master) = mute_master().await;
        let client = client_of(
            &addr,
            SessionTimeouts {
                handshake: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let connected = Arc::clone(&client.connected);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(client.run(shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while accepted.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client never redialed");
        assert!(!connected.load(Ordering::Acquire));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        master.abort();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_pending_handshake() {
        let (addr, accepted, master) = mute_master().await;
        let client = client_of(
            &addr,
            SessionTimeouts {
                handshake: Duration::from_secs(600),
                ..Default::default()
            },
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(client.run(shutdown.clone()));

        while accepted.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("client stuck in handshake")
            .unwrap();
        master.abort();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_while_retrying() {
        let (client, _handle) = client();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(client.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
