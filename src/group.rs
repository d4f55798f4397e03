//! Domain groups and their reconciliation pass.

use futures::future::join_all;
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::error::Error;
use crate::metrics::{self, Timer};
use crate::resolver::{FailurePolicy, Resolver};
use crate::table::RouteTable;

/// Update interval for sources that do not set one.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Longest accepted update interval (one year).
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Identity of a group, used as the owner of routes it needs.
///
/// Equal to the group's position in the configuration. There is no
/// `Default`: every token comes from [`GroupId::new`], so a zeroed value
/// cannot stand in for group 0 by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(usize);

impl GroupId {
    /// Token for the group at `index`.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Position of the group in the configuration.
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sources.{}", self.0)
    }
}

/// Domains resolved together on one interval through one resolver.
#[derive(Debug)]
pub struct Group {
    id: GroupId,
    domains: Vec<String>,
    interval: Duration,
    resolver: Arc<Resolver>,
}

impl Group {
    /// Build a group from validated parts.
    pub fn new(
        id: GroupId,
        domains: Vec<String>,
        interval: Duration,
        resolver: Arc<Resolver>,
    ) -> Self {
        Self {
            id,
            domains,
            interval,
            resolver,
        }
    }

    /// Build a group from its configuration section.
    ///
    /// A missing interval falls back to [`DEFAULT_INTERVAL`]; an unparsable,
    /// zero or longer than [`MAX_INTERVAL`] interval is an error.
    pub fn from_config(
        id: GroupId,
        source: &SourceConfig,
        resolver: Arc<Resolver>,
    ) -> Result<Self, Error> {
        let interval = match source.interval.as_deref() {
            None | Some("") => {
                info!(
                    group = %id,
                    default = %humantime::format_duration(DEFAULT_INTERVAL),
                    "interval is not set, using default"
                );
                DEFAULT_INTERVAL
            }
            Some(raw) => {
                let interval = humantime::parse_duration(raw).map_err(|e| {
                    Error::Config(format!(
                        "{id}: error reading update interval string \"{raw}\": {e}"
                    ))
                })?;
                if interval.is_zero() {
                    return Err(Error::Config(format!("{id}: interval must be positive")));
                }
                if interval > MAX_INTERVAL {
                    return Err(Error::Config(format!(
                        "{id}: interval \"{raw}\" exceeds {}",
                        humantime::format_duration(MAX_INTERVAL)
                    )));
                }
                interval
            }
        };

        Ok(Self::new(id, source.domains.clone(), interval, resolver))
    }

    /// Owner token of this group.
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Domains in configuration order.
    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Time between two updates.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Resolver used for every domain of the group.
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Resolve every domain and return the union of the addresses found.
    ///
    /// A domain that no nameserver could resolve is logged and skipped.
    pub async fn resolve_all(&self) -> BTreeSet<Ipv4Addr> {
        let lookups = self.domains.iter().map(|domain| async move {
            debug!(group = %self.id, %domain, "resolving");
            (domain, self.resolver.resolve(domain).await)
        });

        let mut desired = BTreeSet::new();
        for (domain, result) in join_all(lookups).await {
            match result {
                Ok(ips) => {
                    debug!(group = %self.id, %domain, ips = ?ips, "resolved");
                    desired.extend(ips);
                }
                Err(e) => {
                    if self.resolver.on_failure() == FailurePolicy::Hold {
                        debug!(group = %self.id, "on_failure \"hold\" is not implemented, dropping");
                    }
                    warn!(
                        group = %self.id,
                        %domain,
                        error = %e,
                        "Resolution failed for domain (skipping)"
                    );
                }
            }
        }
        desired
    }

    /// Resolve the group's domains and make its routes match the result.
    pub async fn update(&self, table: &mut RouteTable) {
        let timer = Timer::start();
        debug!(
            group = %self.id,
            domains = self.domains.len(),
            nameservers = ?self.resolver.nameservers(),
            "Updating group"
        );

        let desired: Vec<Ipv4Addr> = self.resolve_all().await.into_iter().collect();
        table.replace(self.id, &desired).await;

        metrics::record_group_update(self.id, desired.len(), timer.elapsed());
        debug!(
            group = %self.id,
            addresses = desired.len(),
            next_update_in = %humantime::format_duration(self.interval),
            "Updated group"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolveError;
    use crate::resolver::DnsExchange;
    use async_trait::async_trait;
    use hickory_proto::op::Message;
    use std::net::IpAddr;

    struct Unreachable;

    #[async_trait]
    impl DnsExchange for Unreachable {
        async fn exchange(&self, nameserver: IpAddr, _: Message) -> Result<Message, ResolveError> {
            Err(ResolveError::Timeout(nameserver))
        }
    }

    fn resolver() -> Arc<Resolver> {
        Arc::new(Resolver::new(
            vec!["10.0.0.53".parse().unwrap()],
            FailurePolicy::Drop,
            Arc::new(Unreachable),
        ))
    }

    fn source(interval: Option<&str>) -> SourceConfig {
        SourceConfig {
            interval: interval.map(String::from),
            domains: vec!["a.example".to_string(), "b.example".to_string()],
            resolver: None,
        }
    }

    #[test]
    fn test_group_id_identity() {
        assert_eq!(GroupId::new(0), GroupId::new(0));
        assert_ne!(GroupId::new(0), GroupId::new(1));
        assert_eq!(GroupId::new(3).index(), 3);
        assert_eq!(GroupId::new(2).to_string(), "sources.2");
    }

    #[test]
    fn test_default_interval() {
        let group = Group::from_config(GroupId::new(0), &source(None), resolver()).unwrap();
        assert_eq!(group.interval(), DEFAULT_INTERVAL);
        assert_eq!(group.domains().len(), 2);

        let group = Group::from_config(GroupId::new(0), &source(Some("")), resolver()).unwrap();
        assert_eq!(group.interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_interval_parsing() {
        let group = Group::from_config(GroupId::new(1), &source(Some("1h 30m")), resolver()).unwrap();
        assert_eq!(group.interval(), Duration::from_secs(90 * 60));
        assert_eq!(group.id(), GroupId::new(1));
    }

    #[test]
    fn test_unparsable_interval_is_error() {
        let err = Group::from_config(GroupId::new(4), &source(Some("hourly")), resolver()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("sources.4"));
        assert!(msg.contains("hourly"));
    }

    #[test]
    fn test_zero_interval_is_error() {
        assert!(Group::from_config(GroupId::new(0), &source(Some("0s")), resolver()).is_err());
    }

    #[test]
    fn test_oversized_interval_is_error() {
        let err = Group::from_config(GroupId::new(2), &source(Some("500000000000y")), resolver())
            .unwrap_err();
        assert!(err.to_string().contains("sources.2"));
        assert!(err.to_string().contains("500000000000y"));

        assert!(Group::from_config(GroupId::new(0), &source(Some("2years")), resolver()).is_err());
        let group = Group::from_config(GroupId::new(0), &source(Some("365days")), resolver()).unwrap();
        assert_eq!(group.interval(), MAX_INTERVAL);
    }

    #[tokio::test]
    async fn test_resolve_all_skips_failed_domains() {
        let group = Group::from_config(GroupId::new(0), &source(None), resolver()).unwrap();
        assert!(group.resolve_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_hold_policy_still_drops_failed_domains() {
        let hold = Arc::new(Resolver::new(
            vec!["10.0.0.53".parse().unwrap()],
            FailurePolicy::Hold,
            Arc::new(Unreachable),
        ));
        let group = Group::from_config(GroupId::new(0), &source(None), hold).unwrap();
        assert_eq!(group.resolver().on_failure(), FailurePolicy::Hold);
        assert!(group.resolve_all().await.is_empty());
    }
}
