//! Process wiring: builds the manager, services, cluster API and capture
//! source for the configured role and runs them until shutdown.

use crate::api::{ApiClient, ApiServer, SubscriberLimits, SubscriberSet};
use crate::capture::{CaptureOptions, CaptureSource};
use crate::config::{NladConfig, Role};
use crate::error::{NladError, Result};
use crate::manager::NodeManager;
use crate::metrics::NladMetrics;
use crate::metrics_server::MetricsServer;
use crate::service::NlaChannels;
use crate::services::{LogService, MasterService, NetlinkKernelWriter, ReapplyService, SlaveService};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Daemon {
    config: NladConfig,
    shutdown: CancellationToken,
    metrics: NladMetrics,
    bound: Option<oneshot::Sender<Vec<SocketAddr>>>,
}

impl Daemon {
    pub fn new(config: NladConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shutdown: CancellationToken::new(),
            metrics: NladMetrics::new()?,
            bound: None,
        })
    }

    /// Cancelling this token stops the daemon.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> NladMetrics {
        self.metrics.clone()
    }

    /// Receives the cluster API's bound addresses once a master is listening.
    pub fn on_bound(&mut self) -> oneshot::Receiver<Vec<SocketAddr>> {
        let (tx, rx) = oneshot::channel();
        self.bound = Some(tx);
        rx
    }

    fn subscriber_limits(&self) -> SubscriberLimits {
        SubscriberLimits {
            buffer: self.config.api.subscriber_buffer,
            max_overflows: self.config.api.max_overflows,
            max_subscribers: self.config.api.max_subscribers,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let nid = self.config.nid();
        let role = self.config.role()?;
        info!(nid = %nid, role = role.name(), "nlad starting");

        let (channels, receivers) = NlaChannels::new(self.config.manager.queue_size);
        let mut manager = NodeManager::new(
            nid,
            channels.clone(),
            receivers,
            self.shutdown.clone(),
            self.metrics.clone(),
        );

        manager.register(Box::new(LogService::new()));
        let writer = NetlinkKernelWriter::new()?;
        manager.register(Box::new(ReapplyService::new(nid, Box::new(writer))));

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut resync_rx: Option<mpsc::Receiver<()>> = None;
        let timeouts = self.config.session_timeouts();

        if self.config.metrics.enabled {
            let endpoint = MetricsServer::bind(&self.config.metrics.listen, self.metrics.clone()).await?;
            tasks.push(tokio::spawn(endpoint.run(self.shutdown.clone())));
        }

        match &role {
            Role::Master => {
                let subscribers = Arc::new(
                    SubscriberSet::new(self.subscriber_limits()).with_metrics(self.metrics.clone()),
                );
                let addrs = [self.config.nla.core.clone(), self.config.nla.api.clone()];
                let server = ApiServer::bind(
                    &addrs,
                    nid,
                    channels.clone(),
                    Arc::clone(&subscribers),
                    self.metrics.clone(),
                )
                .await?
                .with_timeouts(timeouts);

                if let Some(bound) = self.bound.take() {
                    let _ = bound.send(server.local_addrs());
                }

                manager.register(Box::new(MasterService::new(subscribers)));
                tasks.push(tokio::spawn(server.run(self.shutdown.clone())));
            }
            Role::Slave { master_addr } => {
                let (client, forward) = ApiClient::new(
                    nid,
                    master_addr.clone(),
                    self.config.retry_interval(),
                    self.config.api.forward_queue,
                    channels.clone(),
                    self.metrics.clone(),
                );

                let client = client.with_timeouts(timeouts);
                let client = if self.config.api.resync_on_connect {
                    let (tx, rx) = mpsc::channel(1);
                    resync_rx = Some(rx);
                    client.with_resync(tx)
                } else {
                    client
                };

                manager.register(Box::new(SlaveService::new(forward, self.metrics.clone())));
                tasks.push(tokio::spawn(client.run(self.shutdown.clone())));
            }
        }

        debug!(services = ?manager.service_names(), "Services registered");
        if let Err(e) = manager.start().await {
            self.shutdown.cancel();
            return Err(e);
        }

        let capture = if self.config.capture.enabled {
            let mut source = CaptureSource::new(
                nid,
                CaptureOptions::from_config(&self.config),
                channels.clone(),
                self.metrics.clone(),
            );
            if let Some(rx) = resync_rx {
                source = source.with_resync(rx);
            }
            Some(tokio::spawn(source.run(self.shutdown.clone())))
        } else {
            info!("Kernel capture disabled");
            None
        };
        drop(channels);

        manager.run().await;
        self.shutdown.cancel();

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Task ended abnormally");
            }
        }

        let result = match capture {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(NladError::Netlink(format!("Capture task failed: {}", e))),
            },
            None => Ok(()),
        };

        debug!(metrics = %self.metrics.render(), "Final metrics");
        info!(nid = %nid, "nlad stopped");
        result
    }
}
