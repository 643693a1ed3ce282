//! A [`Hop`] is the immutable (transport, host, port) destination a
//! [`crate::transport::Channel`] is opened against. It never changes once
//! built — route changes, redirects, and DNS re-resolution all produce a new
//! `Hop` rather than mutating an existing one.

use std::fmt;

/// The three transports this core drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    /// UDP has no ordered byte stream, so retransmission is the channel's
    /// responsibility rather than the transport's.
    pub fn is_reliable(self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    pub fn default_port(self) -> u16 {
        match self {
            TransportKind::Tls => 5061,
            TransportKind::Udp | TransportKind::Tcp => 5060,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        };
        write!(f, "{s}")
    }
}

/// One (transport, host, port) destination. Two `Hop`s with the same fields
/// are considered the same peer for channel-reuse purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hop {
    transport: TransportKind,
    host: String,
    port: u16,
    /// Whether the port above was explicit in the originating URI, as
    /// opposed to filled in from `transport.default_port()`. Needed because
    /// two hops that only differ in "was the default port spelled out"
    /// still address the same peer.
    port_is_explicit: bool,
    /// CNAME/target as returned by SRV resolution, kept separately from
    /// `host` because some callers route on the original name while the
    /// resolved target differs (SRV target vs. original domain).
    cname: Option<String>,
    /// Opaque identifier letting a caller disambiguate multiple logical
    /// accounts that route through this same hop (e.g. two registered
    /// identities behind one outbound proxy that must not share one
    /// Authorization cache). Never interpreted by this crate.
    account_tag: Option<String>,
}

impl Hop {
    pub fn new(transport: TransportKind, host: impl Into<String>, port: Option<u16>) -> Self {
        let port_is_explicit = port.is_some();
        Hop {
            transport,
            host: host.into(),
            port: port.unwrap_or_else(|| transport.default_port()),
            port_is_explicit,
            cname: None,
            account_tag: None,
        }
    }

    pub fn with_cname(mut self, cname: impl Into<String>) -> Self {
        self.cname = Some(cname.into());
        self
    }

    pub fn with_account_tag(mut self, tag: impl Into<String>) -> Self {
        self.account_tag = Some(tag.into());
        self
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn port_is_explicit(&self) -> bool {
        self.port_is_explicit
    }

    pub fn cname(&self) -> Option<&str> {
        self.cname.as_deref()
    }

    pub fn account_tag(&self) -> Option<&str> {
        self.account_tag.as_deref()
    }

    /// The name resolution should look up: the CNAME when one was learned
    /// from SRV, otherwise the original host.
    pub fn resolve_name(&self) -> &str {
        self.cname.as_deref().unwrap_or(&self.host)
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.transport, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_filled_when_absent() {
        let hop = Hop::new(TransportKind::Tls, "proxy.example.org", None);
        assert_eq!(hop.port(), 5061);
        assert!(!hop.port_is_explicit());
    }

    #[test]
    fn explicit_port_is_tracked() {
        let hop = Hop::new(TransportKind::Udp, "proxy.example.org", Some(5070));
        assert_eq!(hop.port(), 5070);
        assert!(hop.port_is_explicit());
    }

    #[test]
    fn resolve_name_prefers_cname() {
        let hop = Hop::new(TransportKind::Tcp, "sip.example.org", None)
            .with_cname("a.example.org");
        assert_eq!(hop.resolve_name(), "a.example.org");
    }
}
