//! Shared test infrastructure for reconciliation and scheduling tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, CNAME};
use hickory_proto::rr::{Name, RData, Record};

use dns_routes::config::{Config, ResolverConfig, SourceConfig, TargetConfig, TelemetryConfig};
use dns_routes::{
    DnsExchange, Error, FailurePolicy, Group, GroupId, HostRoute, ResolveError, Resolver,
    RouteProgrammer, RouteTable, RouteTarget,
};

// --- Constants ---

pub const LINK: &str = "wg0";
pub const LINK_INDEX: u32 = 4;
pub const GATEWAY: &str = "10.8.0.1";
pub const METRIC: u32 = 100;
pub const NS1: &str = "10.0.0.53";
pub const NS2: &str = "10.0.1.53";

pub fn ns(s: &str) -> IpAddr {
    s.parse().unwrap()
}

// --- ScriptedExchange ---

/// What a nameserver does for a given query name.
#[derive(Clone, Debug)]
pub enum Reply {
    Records(Vec<Record>),
    Code(ResponseCode),
    Timeout,
}

/// DNS transport with answers keyed by (nameserver, query name).
///
/// Names are fully qualified (`"a.example."`). Unscripted pairs time out.
/// Answers can be changed between updates to simulate DNS changes.
#[derive(Default)]
pub struct ScriptedExchange {
    replies: Mutex<HashMap<(IpAddr, String), Reply>>,
    calls: Mutex<Vec<(IpAddr, String)>>,
}

impl ScriptedExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, nameserver: &str, qname: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert((ns(nameserver), qname.to_string()), reply);
    }

    /// Script A records for `qname` (fully qualified).
    pub fn set_a(&self, nameserver: &str, qname: &str, ips: &[Ipv4Addr]) {
        let records = ips.iter().map(|ip| a_record(qname, *ip)).collect();
        self.set(nameserver, qname, Reply::Records(records));
    }

    /// Script a lone CNAME answer.
    pub fn set_cname(&self, nameserver: &str, qname: &str, target: &str) {
        self.set(
            nameserver,
            qname,
            Reply::Records(vec![cname_record(qname, target)]),
        );
    }

    pub fn calls(&self) -> Vec<(IpAddr, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DnsExchange for ScriptedExchange {
    async fn exchange(&self, nameserver: IpAddr, query: Message) -> Result<Message, ResolveError> {
        let qname = query.queries()[0].name().to_string();
        self.calls.lock().unwrap().push((nameserver, qname.clone()));

        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&(nameserver, qname))
            .cloned()
            .unwrap_or(Reply::Timeout);

        let mut response = Message::new();
        response.set_id(query.id());
        response.set_message_type(MessageType::Response);
        response.add_queries(query.queries().to_vec());
        match reply {
            Reply::Records(records) => {
                response.add_answers(records);
            }
            Reply::Code(code) => {
                response.set_response_code(code);
            }
            Reply::Timeout => return Err(ResolveError::Timeout(nameserver)),
        }
        Ok(response)
    }
}

pub fn a_record(owner: &str, ip: Ipv4Addr) -> Record {
    Record::from_rdata(Name::from_ascii(owner).unwrap(), 60, RData::A(A::from(ip)))
}

pub fn cname_record(owner: &str, target: &str) -> Record {
    Record::from_rdata(
        Name::from_ascii(owner).unwrap(),
        60,
        RData::CNAME(CNAME(Name::from_ascii(target).unwrap())),
    )
}

// --- RecordingProgrammer ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteCall {
    Install(Ipv4Addr),
    Delete(Ipv4Addr),
}

/// Route programmer that records calls instead of touching the kernel.
#[derive(Default)]
pub struct RecordingProgrammer {
    calls: Mutex<Vec<RouteCall>>,
    installed: Mutex<BTreeSet<Ipv4Addr>>,
    fail_install: Mutex<BTreeSet<Ipv4Addr>>,
}

impl RecordingProgrammer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<RouteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Routes currently present in the simulated kernel table.
    pub fn installed(&self) -> Vec<Ipv4Addr> {
        self.installed.lock().unwrap().iter().copied().collect()
    }

    pub fn fail_install(&self, ip: Ipv4Addr) {
        self.fail_install.lock().unwrap().insert(ip);
    }

    pub fn installs(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, RouteCall::Install(_)))
            .count()
    }

    pub fn deletes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, RouteCall::Delete(_)))
            .count()
    }
}

#[async_trait]
impl RouteProgrammer for RecordingProgrammer {
    fn link_index(&self, name: &str) -> Result<u32, Error> {
        if name == LINK {
            Ok(LINK_INDEX)
        } else {
            Err(Error::LinkNotFound {
                name: name.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        }
    }

    async fn install(&self, _: &RouteTarget, route: &HostRoute) -> Result<(), Error> {
        let ip = route.destination();
        self.calls.lock().unwrap().push(RouteCall::Install(ip));
        if self.fail_install.lock().unwrap().contains(&ip) {
            return Err(Error::RouteCommand {
                command: format!("ip -4 route replace {route}"),
                stderr: "RTNETLINK answers: Operation not permitted".to_string(),
            });
        }
        self.installed.lock().unwrap().insert(ip);
        Ok(())
    }

    async fn delete(&self, _: &RouteTarget, route: &HostRoute) -> Result<(), Error> {
        let ip = route.destination();
        self.calls.lock().unwrap().push(RouteCall::Delete(ip));
        self.installed.lock().unwrap().remove(&ip);
        Ok(())
    }
}

// --- Builders ---

pub async fn bound_table(programmer: Arc<RecordingProgrammer>) -> RouteTable {
    let mut table = RouteTable::new(programmer);
    table.bind(LINK, GATEWAY, METRIC).await.unwrap();
    table
}

pub fn resolver(exchange: Arc<ScriptedExchange>, nameservers: &[&str]) -> Arc<Resolver> {
    Arc::new(Resolver::new(
        nameservers.iter().map(|s| ns(s)).collect(),
        FailurePolicy::Drop,
        exchange,
    ))
}

pub fn group(index: usize, domains: &[&str], interval: Duration, resolver: Arc<Resolver>) -> Group {
    Group::new(
        GroupId::new(index),
        domains.iter().map(|d| d.to_string()).collect(),
        interval,
        resolver,
    )
}

pub fn resolver_config(nameservers: &[&str]) -> ResolverConfig {
    ResolverConfig {
        nameservers: nameservers.iter().map(|s| s.to_string()).collect(),
        on_failure: None,
        timeout: None,
    }
}

pub fn source(interval: Option<&str>, domains: &[&str]) -> SourceConfig {
    SourceConfig {
        interval: interval.map(String::from),
        domains: domains.iter().map(|d| d.to_string()).collect(),
        resolver: None,
    }
}

pub fn test_config(sources: Vec<SourceConfig>) -> Config {
    Config {
        version: "1".to_string(),
        target: TargetConfig {
            name: LINK.to_string(),
            gateway: GATEWAY.to_string(),
            metric: METRIC,
        },
        default_resolver: resolver_config(&[NS1]),
        sources,
        telemetry: TelemetryConfig::default(),
    }
}
