//! Capture source
//!
//! Reads the kernel's route-netlink multicast stream and feeds the node
//! manager's local queue. Two tasks:
//!
//! - reader: only reads datagrams into a bounded raw queue, and issues dump
//!   requests one at a time;
//! - parser: frames and decodes each datagram and pushes the resulting
//!   envelopes, blocking only on the local queue.
//!
//! `EINTR`/`EAGAIN` are retried. `ENOBUFS` means events were lost: it is
//! counted and every table is dumped again. Any other socket error or
//! framing failure cancels the shutdown token and is returned.

pub mod bridge;
pub mod decode;
pub mod socket;

use crate::config::NladConfig;
use crate::error::Result;
use crate::metrics::NladMetrics;
use crate::service::NlaChannels;
use bridge::BridgeVlanTable;
use decode::{
    decode, dump_status, split_messages, Decoded, DumpStatus, NLMSG_DONE, NLMSG_ERROR, NLMSG_NOOP,
};
use nla_msg::opcode::RTM_DELLINK;
use nla_msg::{msg_type_name, Envelope, NodeId, Payload, Source};
use socket::DumpKind;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Largest datagram read from the socket
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub recv_chan_size: usize,
    pub recv_sock_buf: usize,
    pub dump_on_start: bool,
}

impl CaptureOptions {
    pub fn from_config(config: &NladConfig) -> Self {
        Self {
            recv_chan_size: config.nla.recv_chan_size,
            recv_sock_buf: config.nla.recv_sock_buf,
            dump_on_start: config.capture.dump_on_start,
        }
    }
}

pub struct CaptureSource {
    nid: NodeId,
    options: CaptureOptions,
    channels: NlaChannels,
    metrics: NladMetrics,
    resync: Option<mpsc::Receiver<()>>,
}

impl CaptureSource {
    pub fn new(
        nid: NodeId,
        options: CaptureOptions,
        channels: NlaChannels,
        metrics: NladMetrics,
    ) -> Self {
        Self {
            nid,
            options,
            channels,
            metrics,
            resync: None,
        }
    }

    /// Each message on `resync` requests a fresh kernel dump.
    pub fn with_resync(mut self, resync: mpsc::Receiver<()>) -> Self {
        self.resync = Some(resync);
        self
    }

    /// Runs until `shutdown` is cancelled. A fatal error cancels `shutdown`
    /// before it is returned.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let result = self.capture(&shutdown).await;
        if let Err(e) = &result {
            error!(error = %e, "Capture source failed");
            shutdown.cancel();
        }
        result
    }

    #[cfg(target_os = "linux")]
    async fn capture(self, shutdown: &CancellationToken) -> Result<()> {
        use crate::error::NladError;

        let socket = socket::AsyncNetlinkSocket::new(self.options.recv_sock_buf)?;
        let (raw_tx, raw_rx) = mpsc::channel(self.options.recv_chan_size);
        info!(nid = %self.nid, "Capture source started");

        let reader = tokio::spawn(reader::read_loop(
            socket,
            raw_tx,
            self.resync,
            self.options.dump_on_start,
            shutdown.clone(),
            self.metrics.clone(),
        ));

        let parsed = parse_loop(raw_rx, self.nid, self.channels, self.metrics, shutdown).await;
        if !shutdown.is_cancelled() {
            reader.abort();
        }

        let read = match reader.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(NladError::Netlink(format!("Reader task failed: {}", e))),
        };

        info!("Capture source stopped");
        parsed.and(read)
    }

    #[cfg(not(target_os = "linux"))]
    async fn capture(self, shutdown: &CancellationToken) -> Result<()> {
        warn!(nid = %self.nid, "Kernel capture is only available on Linux");
        let _ = (self.options, self.channels, self.metrics, self.resync);
        shutdown.cancelled().await;
        Ok(())
    }
}

/// Turns datagrams into envelopes. Holds the per-source sequence counter
/// and the bridge port VLAN lists across datagrams.
pub struct DatagramParser {
    nid: NodeId,
    seq: u64,
    vlans: BridgeVlanTable,
}

impl DatagramParser {
    pub fn new(nid: NodeId) -> Self {
        Self {
            nid,
            seq: 0,
            vlans: BridgeVlanTable::default(),
        }
    }

    /// Sequence number of the last envelope produced
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Frames and decodes one datagram.
    pub fn parse(&mut self, datagram: &[u8], metrics: &NladMetrics) -> Result<Vec<Envelope>> {
        let mut envelopes = Vec::new();

        for raw in split_messages(datagram)? {
            match decode(&raw) {
                Decoded::Message(msg_type, payload) => {
                    envelopes.push(self.envelope(msg_type, payload, metrics)?);
                }
                Decoded::BridgePort {
                    msg_type,
                    index,
                    vlans,
                } => {
                    let changes = match (msg_type, vlans) {
                        (RTM_DELLINK, _) => self.vlans.remove(index),
                        (_, Some(vlans)) => self.vlans.update(index, vlans),
                        (_, None) => Vec::new(),
                    };
                    for (msg_type, vlan) in changes {
                        envelopes.push(self.envelope(msg_type, Payload::BridgeVlan(vlan), metrics)?);
                    }
                }
                Decoded::Unsupported(NLMSG_NOOP | NLMSG_DONE) => {}
                Decoded::Unsupported(NLMSG_ERROR) => debug!("Netlink error reply"),
                Decoded::Unsupported(msg_type) => {
                    metrics.capture_skipped_total.inc();
                    trace!(msg_type = %msg_type_name(msg_type), "Skipping unsupported message");
                }
                Decoded::Malformed(msg_type, reason) => {
                    metrics.capture_skipped_total.inc();
                    warn!(msg_type = %msg_type_name(msg_type), reason = %reason, "Skipping malformed message");
                }
            }
        }

        Ok(envelopes)
    }

    fn envelope(
        &mut self,
        msg_type: u16,
        payload: Payload,
        metrics: &NladMetrics,
    ) -> Result<Envelope> {
        let envelope = Envelope::new(msg_type, self.nid, Source::Kernel, payload)?
            .with_seq(self.seq + 1);
        self.seq += 1;
        metrics.capture_received_total.inc();
        Ok(envelope)
    }
}

/// Dump requests are serialized: the kernel refuses a second dump on a
/// socket while one is in progress.
#[derive(Debug, Default)]
pub struct DumpQueue {
    pending: VecDeque<DumpKind>,
    in_progress: Option<(u32, DumpKind)>,
}

impl DumpQueue {
    pub fn request_all(&mut self) {
        for kind in DumpKind::ALL {
            if !self.pending.contains(&kind) {
                self.pending.push_back(kind);
            }
        }
    }

    /// Next dump to request; `None` while one is running.
    pub fn next(&mut self) -> Option<DumpKind> {
        if self.in_progress.is_some() {
            return None;
        }
        self.pending.pop_front()
    }

    pub fn started(&mut self, seq: u32, kind: DumpKind) {
        self.in_progress = Some((seq, kind));
    }

    pub fn in_progress(&self) -> Option<DumpKind> {
        self.in_progress.map(|(_, kind)| kind)
    }

    /// Checks a datagram against the running dump and returns true when the
    /// dump ended. A dump refused as busy is queued again.
    pub fn observe(&mut self, datagram: &[u8]) -> bool {
        let Some((seq, kind)) = self.in_progress else {
            return false;
        };

        match dump_status(datagram, seq) {
            DumpStatus::Running => return false,
            DumpStatus::Done => debug!(kind = ?kind, seq, "Dump complete"),
            DumpStatus::Failed(libc::EBUSY) => {
                debug!(kind = ?kind, seq, "Dump refused while another runs, retrying");
                if !self.pending.contains(&kind) {
                    self.pending.push_front(kind);
                }
            }
            DumpStatus::Failed(errno) => {
                warn!(kind = ?kind, seq, errno, "Dump failed");
            }
        }
        self.in_progress = None;
        true
    }

    /// Receive buffer overrun: the running dump may have lost its end
    /// marker and events were dropped, so everything is dumped again.
    pub fn overrun(&mut self) {
        self.in_progress = None;
        self.request_all();
    }
}

async fn parse_loop(
    mut raw_rx: mpsc::Receiver<Vec<u8>>,
    nid: NodeId,
    channels: NlaChannels,
    metrics: NladMetrics,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut parser = DatagramParser::new(nid);

    loop {
        let datagram = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            datagram = raw_rx.recv() => match datagram {
                Some(datagram) => datagram,
                None => return Ok(()),
            },
        };

        for envelope in parser.parse(&datagram, &metrics)? {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                sent = channels.send_local(envelope) => {
                    if sent.is_err() {
                        debug!("Local queue closed, capture parser exiting");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
mod reader {
    use super::socket::AsyncNetlinkSocket;
    use super::{DumpQueue, RECV_BUFFER_SIZE};
    use crate::error::{NladError, Result};
    use crate::metrics::NladMetrics;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, warn};

    fn advance(dumps: &mut DumpQueue, socket: &mut AsyncNetlinkSocket) -> Result<()> {
        if let Some(kind) = dumps.next() {
            let seq = socket.request_dump(kind)?;
            dumps.started(seq, kind);
        }
        Ok(())
    }

    async fn next_resync(resync: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
        match resync {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    pub(super) async fn read_loop(
        mut socket: AsyncNetlinkSocket,
        raw_tx: mpsc::Sender<Vec<u8>>,
        mut resync: Option<mpsc::Receiver<()>>,
        dump_on_start: bool,
        shutdown: CancellationToken,
        metrics: NladMetrics,
    ) -> Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut dumps = DumpQueue::default();
        if dump_on_start {
            dumps.request_all();
            advance(&mut dumps, &mut socket)?;
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                request = next_resync(&mut resync) => match request {
                    Some(()) => {
                        debug!("Resync requested");
                        dumps.request_all();
                        advance(&mut dumps, &mut socket)?;
                    }
                    None => resync = None,
                },
                received = socket.recv(&mut buf) => match received {
                    Ok(len) => {
                        let datagram = buf[..len].to_vec();
                        if dumps.observe(&datagram) {
                            advance(&mut dumps, &mut socket)?;
                        }
                        if raw_tx.send(datagram).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => match e.raw_os_error() {
                        Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                        Some(libc::ENOBUFS) => {
                            metrics.capture_enobufs_total.inc();
                            warn!("Netlink receive buffer overrun (ENOBUFS), dumping all tables again");
                            dumps.overrun();
                            advance(&mut dumps, &mut socket)?;
                        }
                        _ => return Err(NladError::Netlink(format!("Failed to receive: {}", e))),
                    },
                },
            }
        }
    }
}
