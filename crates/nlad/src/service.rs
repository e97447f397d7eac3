//! Service trait and the context handed to services at startup.

use crate::error::{NladError, Result};
use crate::metrics::NladMetrics;
use async_trait::async_trait;
use nla_msg::{Envelope, NetlinkHandler, NodeId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Producer side of the node manager's two inbound queues.
#[derive(Clone, Debug)]
pub struct NlaChannels {
    /// Envelopes captured from the local kernel
    pub local: mpsc::Sender<Envelope>,
    /// Envelopes received over the cluster API
    pub api: mpsc::Sender<Envelope>,
}

/// Consumer side of [`NlaChannels`], owned by the node manager.
#[derive(Debug)]
pub struct NlaReceivers {
    pub local: mpsc::Receiver<Envelope>,
    pub api: mpsc::Receiver<Envelope>,
}

impl NlaChannels {
    /// Creates both bounded queues with `size` slots each.
    pub fn new(size: usize) -> (Self, NlaReceivers) {
        let (local_tx, local_rx) = mpsc::channel(size);
        let (api_tx, api_rx) = mpsc::channel(size);
        (
            Self {
                local: local_tx,
                api: api_tx,
            },
            NlaReceivers {
                local: local_rx,
                api: api_rx,
            },
        )
    }

    /// Pushes onto the API queue, waiting for room.
    pub async fn send_api(&self, envelope: Envelope) -> Result<()> {
        self.api
            .send(envelope)
            .await
            .map_err(|_| NladError::ChannelClosed("api"))
    }

    /// Pushes onto the local queue, waiting for room.
    pub async fn send_local(&self, envelope: Envelope) -> Result<()> {
        self.local
            .send(envelope)
            .await
            .map_err(|_| NladError::ChannelClosed("local"))
    }
}

/// Everything a service may need when it starts.
#[derive(Clone)]
pub struct ServiceContext {
    pub nid: NodeId,
    pub channels: NlaChannels,
    pub shutdown: CancellationToken,
    pub metrics: NladMetrics,
}

/// A consumer registered with the node manager.
///
/// Handlers (from [`NetlinkHandler`]) run synchronously inside the manager's
/// fan-out. Anything slow must be handed off to a task through a queue.
#[async_trait]
pub trait NlaService: NetlinkHandler + Send {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Called once, in registration order, before the first envelope.
    async fn start(&mut self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    /// Called once at shutdown; release sockets and connections.
    async fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use nla_msg::opcode::RTM_NEWLINK;
    use nla_msg::{Link, Payload, Source};

    #[tokio::test]
    async fn test_channels_deliver_to_receivers() {
        let (channels, mut receivers) = NlaChannels::new(4);
        let env = Envelope::new(
            RTM_NEWLINK,
            NodeId(1),
            Source::Kernel,
            Payload::Link(Link::new(1, "lo")),
        )
        .unwrap();

        channels.send_local(env.clone()).await.unwrap();
        channels.send_api(env.clone().with_source(Source::Api)).await.unwrap();

        assert_eq!(receivers.local.recv().await.unwrap(), env);
        assert_eq!(receivers.api.recv().await.unwrap().source(), Source::Api);
    }

    #[tokio::test]
    async fn test_send_on_closed_channel() {
        let (channels, receivers) = NlaChannels::new(1);
        drop(receivers);
        let env = Envelope::new(
            RTM_NEWLINK,
            NodeId(1),
            Source::Kernel,
            Payload::Link(Link::new(1, "lo")),
        )
        .unwrap();
        assert!(matches!(
            channels.send_local(env).await,
            Err(NladError::ChannelClosed("local"))
        ));
    }
}
