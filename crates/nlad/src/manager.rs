//! Node manager.
//!
//! Owns the registered services and the two inbound queues (local kernel
//! events and cluster API events). Each envelope is delivered to every
//! service, in registration order, before the next one is taken. A service
//! that returns an error or panics is logged and skipped for that envelope
//! only; the services after it still receive it.

use crate::error::{NladError, Result};
use crate::metrics::NladMetrics;
use crate::service::{NlaChannels, NlaReceivers, NlaService, ServiceContext};
use nla_msg::{dispatch, Envelope, NodeId};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which queue an envelope was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Api,
}

pub struct NodeManager {
    nid: NodeId,
    services: Vec<Box<dyn NlaService>>,
    channels: NlaChannels,
    receivers: NlaReceivers,
    shutdown: CancellationToken,
    metrics: NladMetrics,
}

impl NodeManager {
    pub fn new(
        nid: NodeId,
        channels: NlaChannels,
        receivers: NlaReceivers,
        shutdown: CancellationToken,
        metrics: NladMetrics,
    ) -> Self {
        Self {
            nid,
            services: Vec::new(),
            channels,
            receivers,
            shutdown,
            metrics,
        }
    }

    /// Registers a service. Delivery follows registration order.
    pub fn register(&mut self, service: Box<dyn NlaService>) {
        info!(nid = %self.nid, service = service.name(), "Registering service");
        self.services.push(service);
    }

    pub fn service_names(&self) -> Vec<&'static str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    pub fn context(&self) -> ServiceContext {
        ServiceContext {
            nid: self.nid,
            channels: self.channels.clone(),
            shutdown: self.shutdown.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Starts every service in registration order; the first failure aborts.
    pub async fn start(&mut self) -> Result<()> {
        let ctx = self.context();
        for service in self.services.iter_mut() {
            service
                .start(&ctx)
                .await
                .map_err(|e| NladError::ServiceStart {
                    name: service.name(),
                    reason: e.to_string(),
                })?;
            debug!(service = service.name(), "Service started");
        }
        info!(nid = %self.nid, services = self.services.len(), "Node manager started");
        Ok(())
    }

    /// Event loop. Returns when the shutdown token is cancelled or both
    /// queues are closed, after stopping every service.
    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Node manager: shutdown requested");
                    break;
                }
                Some(envelope) = self.receivers.local.recv() => {
                    self.fan_out(&envelope, Origin::Local);
                }
                Some(envelope) = self.receivers.api.recv() => {
                    self.fan_out(&envelope, Origin::Api);
                }
                else => {
                    info!("Node manager: all queues closed");
                    break;
                }
            }
        }

        self.stop().await;
    }

    pub async fn stop(&mut self) {
        for service in self.services.iter_mut() {
            service.stop().await;
        }
        info!(nid = %self.nid, "Node manager stopped");
    }

    /// Delivers one envelope to every service. Returns the number of
    /// services whose handler failed.
    pub fn fan_out(&mut self, envelope: &Envelope, origin: Origin) -> usize {
        match origin {
            Origin::Local => self.metrics.dispatched_local_total.inc(),
            Origin::Api => self.metrics.dispatched_api_total.inc(),
        }

        let mut failures = 0;
        for service in self.services.iter_mut() {
            let outcome = catch_unwind(AssertUnwindSafe(|| dispatch(envelope, service.as_mut())));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(
                        service = service.name(),
                        envelope = %envelope,
                        error = %e,
                        "Service handler failed"
                    );
                }
                Err(panic) => {
                    failures += 1;
                    warn!(
                        service = service.name(),
                        envelope = %envelope,
                        panic = panic_message(&*panic),
                        "Service handler panicked"
                    );
                }
            }
        }

        if failures > 0 {
            self.metrics.service_failures_total.inc_by(failures as u64);
        }
        failures
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nla_msg::opcode::*;
    use nla_msg::{HandlerError, HandlerResult, Link, MsgHeader, NetlinkHandler, Payload, Source};
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<(&'static str, u32)>>>;

    enum Mode {
        Ok,
        Fail,
        Panic,
        FailStart,
    }

    struct Scripted {
        name: &'static str,
        mode: Mode,
        log: Log,
    }

    impl NetlinkHandler for Scripted {
        fn on_link(&mut self, _: &MsgHeader, link: &Link) -> HandlerResult {
            match self.mode {
                Mode::Ok | Mode::FailStart => {
                    self.log.lock().push((self.name, link.index));
                    Ok(())
                }
                Mode::Fail => Err(HandlerError::Rejected("boom".into())),
                Mode::Panic => panic!("handler panic"),
            }
        }
    }

    #[async_trait]
    impl NlaService for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn start(&mut self, _ctx: &ServiceContext) -> Result<()> {
            match self.mode {
                Mode::FailStart => Err(NladError::Netlink("no socket".into())),
                _ => {
                    self.log.lock().push((self.name, 0));
                    Ok(())
                }
            }
        }
    }

    fn manager() -> (NodeManager, NlaChannels, CancellationToken) {
        let (channels, receivers) = NlaChannels::new(16);
        let shutdown = CancellationToken::new();
        let manager = NodeManager::new(
            NodeId(1),
            channels.clone(),
            receivers,
            shutdown.clone(),
            NladMetrics::new().unwrap(),
        );
        (manager, channels, shutdown)
    }

    fn link(index: u32) -> Envelope {
        Envelope::new(
            RTM_NEWLINK,
            NodeId(1),
            Source::Kernel,
            Payload::Link(Link::new(index, format!("eth{index}"))),
        )
        .unwrap()
    }

    fn scripted(name: &'static str, mode: Mode, log: &Log) -> Box<dyn NlaService> {
        Box::new(Scripted {
            name,
            mode,
            log: log.clone(),
        })
    }

    #[test]
    fn test_failure_and_panic_isolated() {
        let log: Log = Arc::default();
        let (mut manager, _, _) = manager();
        manager.register(scripted("s1", Mode::Ok, &log));
        manager.register(scripted("s2", Mode::Fail, &log));
        manager.register(scripted("s3", Mode::Panic, &log));
        manager.register(scripted("s4", Mode::Ok, &log));

        let failures = manager.fan_out(&link(7), Origin::Local);
        assert_eq!(failures, 2);
        assert_eq!(*log.lock(), vec![("s1", 7), ("s4", 7)]);
        assert_eq!(manager.metrics.service_failures_total.get(), 2);
    }

    #[tokio::test]
    async fn test_start_failure_names_the_service() {
        let log: Log = Arc::default();
        let (mut manager, _, _) = manager();
        manager.register(scripted("log", Mode::Ok, &log));
        manager.register(scripted("reapply", Mode::FailStart, &log));
        manager.register(scripted("role", Mode::Ok, &log));

        let err = manager.start().await.unwrap_err();
        match &err {
            NladError::ServiceStart { name, reason } => {
                assert_eq!(*name, "reapply");
                assert!(reason.contains("no socket"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Services after the failing one are never started.
        assert_eq!(*log.lock(), vec![("log", 0)]);
    }

    #[test]
    fn test_panic_message_payloads() {
        let literal: Box<dyn std::any::Any + Send> = Box::new("literal");
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn std::any::Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(&*literal), "literal");
        assert_eq!(panic_message(&*owned), "owned");
        assert_eq!(panic_message(&*other), "unknown panic");
    }

    #[tokio::test]
    async fn test_run_delivers_in_order_then_stops() {
        let log: Log = Arc::default();
        let (mut manager, channels, shutdown) = manager();
        manager.register(scripted("log", Mode::Ok, &log));
        manager.register(scripted("role", Mode::Ok, &log));
        manager.start().await.unwrap();
        log.lock().clear();

        for i in 1..=3 {
            channels.send_local(link(i)).await.unwrap();
        }

        let handle = tokio::spawn(async move {
            manager.run().await;
            manager
        });

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while log.lock().len() < 6 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        let manager = handle.await.unwrap();
        assert_eq!(manager.metrics.dispatched_local_total.get(), 3);
        assert_eq!(
            *log.lock(),
            vec![
                ("log", 1),
                ("role", 1),
                ("log", 2),
                ("role", 2),
                ("log", 3),
                ("role", 3)
            ]
        );
    }
}
