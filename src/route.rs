//! Kernel route programming.
//!
//! [`RouteProgrammer`] is the only place that touches the host routing
//! table. The production implementation drives iproute2; tests substitute a
//! recorder.

use async_trait::async_trait;
use std::ffi::CString;
use std::fmt;
use std::net::Ipv4Addr;
use tokio::process::Command;
use tracing::debug;

use crate::error::Error;

/// A host route: one destination address with a full-length mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostRoute {
    destination: Ipv4Addr,
}

impl HostRoute {
    /// Prefix length of every host route.
    pub const PREFIX_LEN: u8 = 32;

    /// Host route to `destination`.
    pub fn new(destination: Ipv4Addr) -> Self {
        Self { destination }
    }

    /// The routed address.
    pub fn destination(&self) -> Ipv4Addr {
        self.destination
    }
}

impl fmt::Display for HostRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.destination, Self::PREFIX_LEN)
    }
}

/// Link, gateway and metric shared by every managed route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Link (interface) name.
    pub link: String,
    /// Kernel index of `link`, resolved at bind time.
    pub link_index: u32,
    /// Next hop, directly reachable on `link`.
    pub gateway: Ipv4Addr,
    /// Route metric.
    pub metric: u32,
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "via {} dev {} onlink metric {}",
            self.gateway, self.link, self.metric
        )
    }
}

/// Installs and deletes host routes in the OS routing table.
#[async_trait]
pub trait RouteProgrammer: Send + Sync {
    /// Resolve a link name to its kernel index.
    fn link_index(&self, name: &str) -> Result<u32, Error>;

    /// Install `route` through `target`. Must succeed if an identical
    /// route is already present.
    async fn install(&self, target: &RouteTarget, route: &HostRoute) -> Result<(), Error>;

    /// Delete `route` through `target`.
    async fn delete(&self, target: &RouteTarget, route: &HostRoute) -> Result<(), Error>;
}

/// Programs routes by running `ip -4 route ...`.
#[derive(Debug, Clone)]
pub struct IpRouteProgrammer {
    program: String,
}

impl Default for IpRouteProgrammer {
    fn default() -> Self {
        Self::new()
    }
}

impl IpRouteProgrammer {
    /// Use `ip` from `PATH`.
    pub fn new() -> Self {
        Self {
            program: "ip".to_string(),
        }
    }

    /// Use a specific iproute2 binary.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, verb: &str, target: &RouteTarget, route: &HostRoute) -> Result<(), Error> {
        let args = route_args(verb, target, route);
        let command = format!("{} {}", self.program, args.join(" "));
        debug!(%command, "running route command");

        let output = Command::new(&self.program).args(&args).output().await?;
        if !output.status.success() {
            return Err(Error::RouteCommand {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Arguments for `ip` that add (`replace`) or delete one host route.
fn route_args(verb: &str, target: &RouteTarget, route: &HostRoute) -> Vec<String> {
    vec![
        "-4".to_string(),
        "route".to_string(),
        verb.to_string(),
        route.to_string(),
        "via".to_string(),
        target.gateway.to_string(),
        "dev".to_string(),
        target.link.clone(),
        "onlink".to_string(),
        "metric".to_string(),
        target.metric.to_string(),
    ]
}

#[async_trait]
impl RouteProgrammer for IpRouteProgrammer {
    fn link_index(&self, name: &str) -> Result<u32, Error> {
        let c_name = CString::new(name).map_err(|e| Error::LinkNotFound {
            name: name.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;

        // SAFETY: `c_name` is a valid NUL-terminated string that outlives
        // the call; `if_nametoindex` does not retain the pointer.
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if index == 0 {
            return Err(Error::LinkNotFound {
                name: name.to_string(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(index)
    }

    async fn install(&self, target: &RouteTarget, route: &HostRoute) -> Result<(), Error> {
        // `replace` also succeeds when the route survived a previous run.
        self.run("replace", target, route).await
    }

    async fn delete(&self, target: &RouteTarget, route: &HostRoute) -> Result<(), Error> {
        self.run("del", target, route).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> RouteTarget {
        RouteTarget {
            link: "wg0".to_string(),
            link_index: 7,
            gateway: Ipv4Addr::new(10, 8, 0, 1),
            metric: 100,
        }
    }

    #[test]
    fn test_host_route_display() {
        let route = HostRoute::new(Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(route.to_string(), "1.2.3.4/32");
        assert_eq!(route.destination(), Ipv4Addr::new(1, 2, 3, 4));
    }

    #[test]
    fn test_target_display() {
        assert_eq!(target().to_string(), "via 10.8.0.1 dev wg0 onlink metric 100");
    }

    #[test]
    fn test_route_args_install() {
        let args = route_args("replace", &target(), &HostRoute::new(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(
            args.join(" "),
            "-4 route replace 1.2.3.4/32 via 10.8.0.1 dev wg0 onlink metric 100"
        );
    }

    #[test]
    fn test_route_args_delete() {
        let args = route_args("del", &target(), &HostRoute::new(Ipv4Addr::new(5, 6, 7, 8)));
        assert_eq!(args[2], "del");
        assert_eq!(args[3], "5.6.7.8/32");
    }

    #[test]
    fn test_link_index_loopback() {
        let programmer = IpRouteProgrammer::new();
        assert!(programmer.link_index("lo").unwrap() > 0);
    }

    #[test]
    fn test_link_index_missing_link() {
        let programmer = IpRouteProgrammer::new();
        let err = programmer.link_index("no-such-link0").unwrap_err();
        assert!(matches!(err, Error::LinkNotFound { .. }));
    }

    #[test]
    fn test_link_index_rejects_nul() {
        let programmer = IpRouteProgrammer::new();
        assert!(programmer.link_index("wg\0").is_err());
    }

    #[tokio::test]
    async fn test_failed_command_reports_stderr() {
        let programmer = IpRouteProgrammer::with_program("false");
        let err = programmer
            .install(&target(), &HostRoute::new(Ipv4Addr::new(1, 2, 3, 4)))
            .await
            .unwrap_err();
        match err {
            Error::RouteCommand { command, .. } => assert!(command.starts_with("false -4 route")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
