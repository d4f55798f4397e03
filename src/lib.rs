//! dns-routes - Host routes that follow DNS.
//!
//! This crate periodically resolves groups of domain names and keeps one
//! host route per resolved IPv4 address through a fixed gateway and link.
//! When a domain's addresses change, routes to the new addresses are
//! installed and routes nobody needs any more are deleted.
//!
//! ## Features
//!
//! - Independent groups, each with its own interval and nameservers
//! - Nameserver fallback and CNAME following per domain
//! - Reference-counted route ownership, so groups can share addresses
//! - Minimal kernel churn: a pass only touches what changed
//! - All managed routes removed on shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         dns-routes                          │
//! │                                                             │
//! │  ┌──────────────┐  mpsc  ┌──────────────┐     ┌──────────┐  │
//! │  │  Scheduler   │───────▶│   consumer   │────▶│  Group   │  │
//! │  │ (timer heap) │        │ (one task)   │     └────┬─────┘  │
//! │  └──────────────┘        └──────────────┘          │        │
//! │                                       ┌────────────┴──┐     │
//! │                                       ▼               ▼     │
//! │                               ┌────────────┐  ┌────────────┐│
//! │                   UDP :53 ◀───│  Resolver  │  │ RouteTable ││──▶ ip route
//! │                               └────────────┘  └────────────┘│
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use dns_routes::{daemon, Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config: Config = load_somehow()?;
//!     let daemon = Daemon::from_config(&config).await?;
//!     daemon.run(daemon::shutdown_signal()).await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod daemon;
pub mod error;
pub mod group;
pub mod metrics;
pub mod resolver;
pub mod route;
pub mod scheduler;
pub mod table;
pub mod telemetry;

// Re-export main types
pub use config::{Config, ResolverConfig, SourceConfig, TargetConfig, TelemetryConfig};
pub use daemon::Daemon;
pub use error::{Error, ResolveError};
pub use group::{Group, GroupId};
pub use resolver::{DnsExchange, FailurePolicy, Resolver, UdpExchange};
pub use route::{HostRoute, IpRouteProgrammer, RouteProgrammer, RouteTarget};
pub use scheduler::Scheduler;
pub use table::{RouteEntry, RouteTable};
