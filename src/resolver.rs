//! Domain resolution against an ordered list of nameservers.
//!
//! Each nameserver is asked for the A records of a domain. A response that
//! only aliases the name is followed through the same nameserver. The first
//! nameserver that produces addresses wins; the next one is tried only when
//! the previous one failed.

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ResolverConfig;
use crate::error::{Error, ResolveError};
use crate::metrics;

/// Standard DNS port.
pub const DNS_PORT: u16 = 53;

/// Per-query timeout when the configuration does not set one.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of CNAME hops followed for one domain.
pub const MAX_CNAME_HOPS: usize = 8;

const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// What to do with a domain's routes when it cannot be resolved.
///
/// Only [`FailurePolicy::Drop`] has an effect. `Hold` is accepted so that
/// configurations written for it load, but no last-known-good pinning
/// exists yet and a failed domain is dropped either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Skip the domain; its addresses leave the group's route set.
    #[default]
    Drop,
    /// Keep the previous addresses. Not implemented.
    Hold,
}

impl FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop" => Ok(Self::Drop),
            "hold" => Ok(Self::Hold),
            other => Err(Error::Config(format!(
                "unsupported value \"{other}\" for option \"on_failure\""
            ))),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Drop => "drop",
            Self::Hold => "hold",
        })
    }
}

/// Sends one DNS query to one nameserver and returns its response.
#[async_trait]
pub trait DnsExchange: Send + Sync {
    /// Exchange `query` with `nameserver`.
    async fn exchange(&self, nameserver: IpAddr, query: Message) -> Result<Message, ResolveError>;
}

/// Plain UDP transport.
#[derive(Debug, Clone)]
pub struct UdpExchange {
    port: u16,
    timeout: Duration,
}

impl Default for UdpExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpExchange {
    /// Transport on port 53 with [`DEFAULT_QUERY_TIMEOUT`].
    pub fn new() -> Self {
        Self {
            port: DNS_PORT,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Override the per-query timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the destination port (useful for testing).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Per-query timeout in effect.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl DnsExchange for UdpExchange {
    async fn exchange(&self, nameserver: IpAddr, query: Message) -> Result<Message, ResolveError> {
        let bytes = query.to_vec()?;

        let local: SocketAddr = match nameserver {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        // Connected sockets drop datagrams from other sources.
        socket.connect((nameserver, self.port)).await?;
        socket.send(&bytes).await?;

        let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
        let len = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| ResolveError::Timeout(nameserver))??;

        let response = Message::from_vec(&buf[..len])?;
        validate_response(nameserver, &query, &response)?;
        Ok(response)
    }
}

/// Check that `response` answers `query` and is complete.
///
/// The id and the question (name, type, class) must match the query. A
/// truncated response is rejected, since its answer section may be partial.
pub fn validate_response(
    nameserver: IpAddr,
    query: &Message,
    response: &Message,
) -> Result<(), ResolveError> {
    if response.id() != query.id() {
        return Err(ResolveError::IdMismatch {
            expected: query.id(),
            got: response.id(),
        });
    }

    let sent = query.queries().first();
    let echoed = response.queries().first();
    let matches = match (sent, echoed) {
        (Some(q), Some(r)) => {
            q.name() == r.name()
                && q.query_type() == r.query_type()
                && q.query_class() == r.query_class()
        }
        _ => false,
    };
    if !matches {
        return Err(ResolveError::QuestionMismatch {
            expected: sent.map_or_else(|| "none".to_string(), ToString::to_string),
            got: echoed.map_or_else(|| "none".to_string(), ToString::to_string),
        });
    }

    if response.truncated() {
        return Err(ResolveError::Truncated(nameserver));
    }

    Ok(())
}

/// Parse the optional `timeout` of a resolver section.
pub fn query_timeout(config: &ResolverConfig) -> Result<Duration, Error> {
    match config.timeout.as_deref() {
        None => Ok(DEFAULT_QUERY_TIMEOUT),
        Some(raw) => humantime::parse_duration(raw).map_err(|e| {
            Error::Config(format!("error reading resolver timeout \"{raw}\": {e}"))
        }),
    }
}

/// Nameserver list plus failure policy, validated at construction.
pub struct Resolver {
    nameservers: Vec<IpAddr>,
    on_failure: FailurePolicy,
    exchange: Arc<dyn DnsExchange>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("nameservers", &self.nameservers)
            .field("on_failure", &self.on_failure)
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// Validate a resolver section and bind it to a transport.
    ///
    /// Fails when no nameserver is listed, a nameserver is not an IP
    /// literal, or `on_failure` is neither "drop" nor "hold".
    pub fn from_config(
        config: &ResolverConfig,
        exchange: Arc<dyn DnsExchange>,
    ) -> Result<Self, Error> {
        let on_failure = match config.on_failure.as_deref() {
            None | Some("") => {
                info!(
                    policy = %FailurePolicy::Drop,
                    "on_failure is not specified, using default"
                );
                FailurePolicy::Drop
            }
            Some(raw) => raw.parse()?,
        };

        if config.nameservers.is_empty() {
            return Err(Error::Config("no nameservers specified".into()));
        }

        let nameservers = config
            .nameservers
            .iter()
            .map(|raw| {
                raw.parse::<IpAddr>().map_err(|_| {
                    Error::InvalidAddress(format!("nameserver \"{raw}\" is not an IP address"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(nameservers, on_failure, exchange))
    }

    /// Build from already-validated parts.
    pub fn new(
        nameservers: Vec<IpAddr>,
        on_failure: FailurePolicy,
        exchange: Arc<dyn DnsExchange>,
    ) -> Self {
        Self {
            nameservers,
            on_failure,
            exchange,
        }
    }

    /// Nameservers in the order they are tried.
    pub fn nameservers(&self) -> &[IpAddr] {
        &self.nameservers
    }

    /// Configured failure policy.
    pub fn on_failure(&self) -> FailurePolicy {
        self.on_failure
    }

    /// Resolve `domain` to its IPv4 addresses.
    ///
    /// Nameservers are tried in order until one of them yields addresses.
    /// Returns [`ResolveError::AllFailed`] when none does.
    pub async fn resolve(&self, domain: &str) -> Result<Vec<Ipv4Addr>, ResolveError> {
        let total = self.nameservers.len();
        let mut attempts = Vec::with_capacity(total);

        for (i, &nameserver) in self.nameservers.iter().enumerate() {
            match self.resolve_via(nameserver, domain).await {
                Ok(ips) => {
                    metrics::record_resolution(true);
                    return Ok(ips);
                }
                Err(e) => {
                    warn!(
                        nameserver = %nameserver,
                        domain,
                        error = %e,
                        attempt = i + 1,
                        total,
                        "Resolution failed, type A"
                    );
                    metrics::record_nameserver_failure();
                    attempts.push(format!("{nameserver}: {e}"));
                }
            }
        }

        metrics::record_resolution(false);
        Err(ResolveError::AllFailed {
            domain: domain.to_string(),
            attempts,
        })
    }

    /// Resolve through a single nameserver, following aliases.
    async fn resolve_via(
        &self,
        nameserver: IpAddr,
        domain: &str,
    ) -> Result<Vec<Ipv4Addr>, ResolveError> {
        let mut name = Name::from_ascii(format!("{}.", domain.trim_end_matches('.')))?;

        for _ in 0..=MAX_CNAME_HOPS {
            let response = self.exchange.exchange(nameserver, build_query(&name)).await?;
            if response.response_code() != ResponseCode::NoError {
                return Err(ResolveError::ResponseCode(response.response_code()));
            }

            match classify(response.answers(), &name) {
                Answer::Addresses(ips) => return Ok(ips),
                Answer::Alias(target) => {
                    debug!(%nameserver, from = %name, to = %target, "following CNAME");
                    name = target;
                }
                Answer::Empty => return Err(ResolveError::NoUsableAnswer(name.to_string())),
            }
        }

        Err(ResolveError::CnameDepth(domain.to_string(), MAX_CNAME_HOPS))
    }
}

/// Build a recursive A query for `name` with a random id.
fn build_query(name: &Name) -> Message {
    let mut message = Message::new();
    message.set_id(rand::random());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name.clone(), RecordType::A));
    message
}

#[derive(Debug, PartialEq)]
enum Answer {
    Addresses(Vec<Ipv4Addr>),
    Alias(Name),
    Empty,
}

/// Sort the answer section into addresses, an alias to chase, or nothing.
///
/// Any A record counts, since a recursive server usually returns the whole
/// CNAME chain with the final addresses. Without A records, the chain is
/// walked from `name` as far as the answer section goes.
fn classify(answers: &[Record], name: &Name) -> Answer {
    let ips: Vec<Ipv4Addr> = answers
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(Ipv4Addr::from(*a)),
            _ => None,
        })
        .collect();
    if !ips.is_empty() {
        return Answer::Addresses(ips);
    }

    let alias_of = |owner: &Name| {
        answers.iter().find_map(|r| match r.data() {
            RData::CNAME(cname) if r.name() == owner => Some(cname.0.clone()),
            _ => None,
        })
    };

    let Some(mut target) = alias_of(name) else {
        return Answer::Empty;
    };
    for _ in 0..MAX_CNAME_HOPS {
        match alias_of(&target) {
            Some(next) => target = next,
            None => break,
        }
    }
    Answer::Alias(target)
}
