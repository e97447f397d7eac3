//! Slave role: forward locally captured envelopes to the master.
//!
//! Only `Source::Kernel` envelopes leave the node. Modifications received
//! from the master come back in as `Source::Api` and are never sent up
//! again, which keeps the cluster loop-free.

use crate::api::{ForwardError, ForwardHandle};
use crate::metrics::NladMetrics;
use crate::service::NlaService;
use async_trait::async_trait;
use nla_msg::{Envelope, HandlerResult, NetlinkHandler, Source};
use tracing::{info, trace};

pub struct SlaveService {
    forward: ForwardHandle,
    metrics: NladMetrics,
    forwarded: u64,
    dropped: u64,
}

impl SlaveService {
    pub fn new(forward: ForwardHandle, metrics: NladMetrics) -> Self {
        Self {
            forward,
            metrics,
            forwarded: 0,
            dropped: 0,
        }
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl NetlinkHandler for SlaveService {
    fn on_message(&mut self, envelope: &Envelope) -> HandlerResult {
        if envelope.source() != Source::Kernel {
            return Ok(());
        }

        match self.forward.forward(envelope.clone()) {
            Ok(()) => self.forwarded += 1,
            Err(reason) => {
                self.dropped += 1;
                self.metrics.api_forward_dropped_total.inc();
                match reason {
                    ForwardError::Disconnected => trace!(envelope = %envelope, "Not connected, dropped"),
                    ForwardError::Full => trace!(envelope = %envelope, "Forward queue full, dropped"),
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NlaService for SlaveService {
    fn name(&self) -> &'static str {
        "slave"
    }

    async fn stop(&mut self) {
        info!(
            forwarded = self.forwarded,
            dropped = self.dropped,
            "Slave service stopped"
        );
    }
}
