//! Reference-counted record of every host route this process installed.
//!
//! Several groups may resolve to the same address. The kernel route for an
//! address is installed when its first owner appears and deleted when its
//! last owner goes away:
//!
//! ```text
//! absent ──add(owner)──▶ present{owner: 1} ──add(other)──▶ present{owner: 1, other: 1}
//!    ▲                                                           │
//!    └──────────── remove/replace drops the last owner ◀─────────┘
//! ```
//!
//! An entry exists exactly when its owner map is non-empty. A kernel route
//! exists exactly when an entry exists; an install that fails leaves no
//! entry behind, so the next reconciliation pass retries it.
//!
//! The table is not synchronized. All mutation happens from the single task
//! that drains the scheduler's update queue.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::group::GroupId;
use crate::metrics;
use crate::route::{HostRoute, RouteProgrammer, RouteTarget};

/// One installed destination and the groups that need it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    route: HostRoute,
    owners: HashMap<GroupId, u32>,
}

impl RouteEntry {
    fn new(route: HostRoute, owner: GroupId) -> Self {
        Self {
            route,
            owners: HashMap::from([(owner, 1)]),
        }
    }

    /// The host route this entry stands for.
    pub fn route(&self) -> HostRoute {
        self.route
    }

    /// Reference count held by `owner`, if any.
    pub fn refcount(&self, owner: GroupId) -> Option<u32> {
        self.owners.get(&owner).copied()
    }

    /// Owners and their reference counts.
    pub fn owners(&self) -> &HashMap<GroupId, u32> {
        &self.owners
    }
}

/// Managed host routes, bound to one link/gateway/metric.
pub struct RouteTable {
    programmer: Arc<dyn RouteProgrammer>,
    target: Option<RouteTarget>,
    routes: BTreeMap<Ipv4Addr, RouteEntry>,
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("target", &self.target)
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

/// Contract check for every mutating operation.
fn bound(target: &Option<RouteTarget>) -> &RouteTarget {
    match target {
        Some(target) => target,
        None => panic!("RouteTable used before bind(): no link/gateway to route through"),
    }
}

impl RouteTable {
    /// Create an unbound, empty table.
    pub fn new(programmer: Arc<dyn RouteProgrammer>) -> Self {
        Self {
            programmer,
            target: None,
            routes: BTreeMap::new(),
        }
    }

    /// Bind the table to a link, gateway and metric.
    ///
    /// Routes installed under a previous binding are deleted first. Fails
    /// when the link does not exist or the gateway is not an IPv4 literal.
    pub async fn bind(&mut self, link: &str, gateway: &str, metric: u32) -> Result<(), Error> {
        let link_index = self.programmer.link_index(link)?;
        let gateway: Ipv4Addr = gateway
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("gateway \"{gateway}\"")))?;

        self.flush().await;

        let target = RouteTarget {
            link: link.to_string(),
            link_index,
            gateway,
            metric,
        };
        info!(%target, link_index, "Route table bound");
        self.target = Some(target);
        Ok(())
    }

    /// The current binding, if any.
    pub fn target(&self) -> Option<&RouteTarget> {
        self.target.as_ref()
    }

    /// Take a reference on `ip` for `owner`, installing the route if it is new.
    ///
    /// When `owner` already holds `ip`, its count grows only if `bump` is set.
    ///
    /// # Panics
    ///
    /// Panics if the table has not been bound.
    pub async fn add(&mut self, owner: GroupId, ip: Ipv4Addr, bump: bool) {
        let target = bound(&self.target);

        if let Some(entry) = self.routes.get_mut(&ip) {
            match entry.owners.get_mut(&owner) {
                Some(count) if bump => *count += 1,
                Some(_) => {}
                None => {
                    entry.owners.insert(owner, 1);
                }
            }
            return;
        }

        let route = HostRoute::new(ip);
        info!(%route, %target, "ROUTE ADD");
        match self.programmer.install(target, &route).await {
            Ok(()) => {
                metrics::record_route_install(true);
                self.routes.insert(ip, RouteEntry::new(route, owner));
                metrics::record_table_size(self.routes.len());
            }
            Err(e) => {
                metrics::record_route_install(false);
                error!(%route, %target, owner = %owner, error = %e, "route install failed");
            }
        }
    }

    /// Drop one reference `owner` holds on `ip`.
    ///
    /// Returns the owner's remaining count, or `None` if it held no
    /// reference. The route is deleted when no owner is left.
    ///
    /// # Panics
    ///
    /// Panics if the table has not been bound.
    pub async fn remove(&mut self, owner: GroupId, ip: Ipv4Addr) -> Option<u32> {
        bound(&self.target);

        let entry = self.routes.get_mut(&ip)?;
        let count = entry.owners.get_mut(&owner)?;
        if *count > 1 {
            *count -= 1;
            return Some(*count);
        }

        entry.owners.remove(&owner);
        if entry.owners.is_empty() {
            self.drop_entry(ip).await;
        }
        Some(0)
    }

    /// Make the set of addresses owned by `owner` exactly `ips`.
    ///
    /// New addresses get one reference, existing ones keep their count,
    /// and addresses missing from `ips` lose `owner` entirely.
    ///
    /// # Panics
    ///
    /// Panics if the table has not been bound.
    pub async fn replace(&mut self, owner: GroupId, ips: &[Ipv4Addr]) {
        bound(&self.target);

        let wanted: BTreeSet<Ipv4Addr> = ips.iter().copied().collect();
        for &ip in &wanted {
            self.add(owner, ip, false).await;
        }

        let stale: Vec<Ipv4Addr> = self
            .routes
            .iter()
            .filter(|(ip, entry)| entry.owners.contains_key(&owner) && !wanted.contains(ip))
            .map(|(ip, _)| *ip)
            .collect();

        for ip in stale {
            if let Some(entry) = self.routes.get_mut(&ip) {
                entry.owners.remove(&owner);
                if entry.owners.is_empty() {
                    self.drop_entry(ip).await;
                }
            }
        }
    }

    /// Delete every managed route and empty the table.
    pub async fn flush(&mut self) {
        if self.routes.is_empty() {
            return;
        }

        let routes = std::mem::take(&mut self.routes);
        warn!(count = routes.len(), "CLEAR: deleting all managed routes");
        if let Some(target) = &self.target {
            for entry in routes.values() {
                delete_route(self.programmer.as_ref(), target, &entry.route).await;
            }
        }
        metrics::record_table_size(0);
    }

    /// Number of managed destinations.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True when no route is managed.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// True when a route to `ip` is managed.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.routes.contains_key(&ip)
    }

    /// Entry for `ip`.
    pub fn get(&self, ip: Ipv4Addr) -> Option<&RouteEntry> {
        self.routes.get(&ip)
    }

    /// Addresses `owner` currently holds, in ascending order.
    pub fn owned_by(&self, owner: GroupId) -> Vec<Ipv4Addr> {
        self.routes
            .iter()
            .filter(|(_, entry)| entry.owners.contains_key(&owner))
            .map(|(ip, _)| *ip)
            .collect()
    }

    /// Remove the ownerless entry for `ip` and delete its route.
    async fn drop_entry(&mut self, ip: Ipv4Addr) {
        if let Some(entry) = self.routes.remove(&ip) {
            delete_route(self.programmer.as_ref(), bound(&self.target), &entry.route).await;
            metrics::record_table_size(self.routes.len());
        }
    }
}

/// Delete one route. Failure is logged; the caller's bookkeeping stands.
async fn delete_route(programmer: &dyn RouteProgrammer, target: &RouteTarget, route: &HostRoute) {
    info!(%route, %target, "ROUTE DEL");
    match programmer.delete(target, route).await {
        Ok(()) => metrics::record_route_delete(true),
        Err(e) => {
            metrics::record_route_delete(false);
            error!(%route, %target, error = %e, "route delete failed");
        }
    }
}
