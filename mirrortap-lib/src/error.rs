use thiserror::Error;

/// Errors raised on the control path (config load, bring-up, teardown).
///
/// Hot-path failures (ring full, send EAGAIN, lost perf samples) are never
/// surfaced as errors; they are counted in the worker statistics instead.
#[derive(Error, Debug)]
pub enum TapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("{op} failed on {iface}: {source}")]
    Iface {
        op: &'static str,
        iface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ARP resolution for {0} exhausted retries")]
    ArpUnresolved(std::net::Ipv4Addr),

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("eBPF error: {0}")]
    Ebpf(#[from] crate::capture::tc::TcTapError),
}

pub type Result<T> = std::result::Result<T, TapError>;
