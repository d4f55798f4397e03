//! Daemon setup and lifecycle management.

use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{Config, ResolverConfig};
use crate::error::Error;
use crate::group::{Group, GroupId};
use crate::resolver::{self, DnsExchange, Resolver, UdpExchange};
use crate::route::{IpRouteProgrammer, RouteProgrammer};
use crate::scheduler::Scheduler;
use crate::table::RouteTable;

/// UDP transport with the given per-query timeout.
pub fn udp_exchange(timeout: Duration) -> Arc<dyn DnsExchange> {
    Arc::new(UdpExchange::new().with_timeout(timeout))
}

fn build_resolver<F>(config: &ResolverConfig, make_exchange: &mut F) -> Result<Resolver, Error>
where
    F: FnMut(Duration) -> Arc<dyn DnsExchange>,
{
    let timeout = resolver::query_timeout(config)?;
    Resolver::from_config(config, make_exchange(timeout))
}

/// Build every group described by `config`.
///
/// `make_exchange` supplies the DNS transport for each resolver, given its
/// query timeout. Sources without a resolver share the default one.
pub fn build_groups<F>(config: &Config, mut make_exchange: F) -> Result<Vec<Group>, Error>
where
    F: FnMut(Duration) -> Arc<dyn DnsExchange>,
{
    let default_resolver = Arc::new(
        build_resolver(&config.default_resolver, &mut make_exchange)
            .map_err(|e| Error::Config(format!("default_resolver init fail: {e}")))?,
    );

    config
        .sources
        .iter()
        .enumerate()
        .map(|(index, source)| {
            let id = GroupId::new(index);
            let resolver = match &source.resolver {
                Some(own) => Arc::new(
                    build_resolver(own, &mut make_exchange)
                        .map_err(|e| Error::Config(format!("{id} resolver init fail: {e}")))?,
                ),
                None => Arc::clone(&default_resolver),
            };
            Group::from_config(id, source, resolver)
        })
        .collect()
}

/// Everything the process runs with: groups, route table, scheduler.
pub struct Daemon {
    scheduler: Scheduler,
}

impl Daemon {
    /// Validate `config`, resolve its link and gateway, and prepare the
    /// groups with UDP resolvers and iproute2 route programming.
    pub async fn from_config(config: &Config) -> Result<Self, Error> {
        config.validate()?;
        let groups = build_groups(config, udp_exchange)?;
        Self::bind(config, groups, Arc::new(IpRouteProgrammer::new())).await
    }

    /// Bind a route table for `config.target` and wrap `groups`.
    pub async fn bind(
        config: &Config,
        groups: Vec<Group>,
        programmer: Arc<dyn RouteProgrammer>,
    ) -> Result<Self, Error> {
        let mut table = RouteTable::new(programmer);
        table
            .bind(
                &config.target.name,
                &config.target.gateway,
                config.target.metric,
            )
            .await?;

        Ok(Self {
            scheduler: Scheduler::new(groups, table),
        })
    }

    /// Get a reference to the scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run until `shutdown` completes and the update queue drains.
    ///
    /// `shutdown` is polled once before anything else. Every group is then
    /// updated once up front, and afterwards on its own interval. All
    /// managed routes are deleted before returning.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        // First poll installs the signal handlers, so a signal during the
        // initial pass is caught instead of killing the process.
        if (&mut shutdown).now_or_never().is_some() {
            warn!("Interruption signal before the first update, finishing");
            self.scheduler.cleanup().await;
            return;
        }

        self.scheduler.update_all().await;

        let Some(mut updates) = self.scheduler.take_updates() else {
            error!("Update queue already taken, nothing to run");
            self.scheduler.cleanup().await;
            return;
        };
        self.scheduler.start();

        let mut stopping = false;

        info!("Entered the update loop");
        loop {
            tokio::select! {
                _ = &mut shutdown, if !stopping => {
                    warn!("Interruption signal, finishing");
                    self.scheduler.stop();
                    stopping = true;
                }
                next = updates.recv() => match next {
                    Some(group) => group.update(self.scheduler.table_mut()).await,
                    None => break,
                }
            }
        }

        info!("Finishing (no more tasks)");
        self.scheduler.cleanup().await;
    }
}

/// Completes on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
