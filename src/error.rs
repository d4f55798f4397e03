//! Error types for dns-routes.

use std::net::IpAddr;
use thiserror::Error;

/// Errors that abort startup or a setup step.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error (process spawn, socket, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Failed to parse address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The named link does not exist on this host.
    #[error("link/interface \"{name}\" not found: {source}")]
    LinkNotFound {
        /// Link name as configured.
        name: String,
        /// Underlying lookup failure.
        source: std::io::Error,
    },

    /// The `ip` tool rejected a route change.
    #[error("route command `{command}` failed: {stderr}")]
    RouteCommand {
        /// The command line that was run.
        command: String,
        /// Trimmed stderr of the failed command.
        stderr: String,
    },

}

/// Errors from resolving a single domain.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Socket error talking to a nameserver.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The nameserver did not answer in time.
    #[error("query to {0} timed out")]
    Timeout(IpAddr),

    /// Malformed query name or response.
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Response id did not match the query id.
    #[error("response id {got} does not match query id {expected}")]
    IdMismatch {
        /// Id sent in the query.
        expected: u16,
        /// Id found in the response.
        got: u16,
    },

    /// Response question section does not echo the query.
    #[error("response question {got} does not match query {expected}")]
    QuestionMismatch {
        /// Question sent in the query.
        expected: String,
        /// Question found in the response, or "none".
        got: String,
    },

    /// Response had the TC bit set; the UDP answer is incomplete.
    #[error("truncated response from {0}")]
    Truncated(IpAddr),

    /// Nameserver answered with a non-NOERROR code.
    #[error("nameserver returned {0}")]
    ResponseCode(hickory_proto::op::ResponseCode),

    /// Response held neither A nor CNAME records.
    #[error("no A or CNAME record for {0}")]
    NoUsableAnswer(String),

    /// CNAME chain longer than the follow limit.
    #[error("CNAME chain for {0} exceeds {1} hops")]
    CnameDepth(String, usize),

    /// Every configured nameserver failed.
    #[error("all {} nameservers failed for {domain}: {}", attempts.len(), attempts.join("; "))]
    AllFailed {
        /// Domain that could not be resolved.
        domain: String,
        /// One message per nameserver, in the order tried.
        attempts: Vec<String>,
    },
}
