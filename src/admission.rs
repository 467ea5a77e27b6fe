//! C3 — IP Admission Filter. Invoked from C2's `on_incoming` before
//! acceptance; decision rules are evaluated in the order given in §4.3.

use std::net::Ipv4Addr;
use std::str::FromStr;

use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("invalid CIDR network: {0}")]
    InvalidCidr(String),
    #[error("invalid IPv4 address: {0}")]
    InvalidIp(String),
}

/// An IPv4 network in CIDR notation (e.g. `217.10.79.0/24`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: u32,
    prefix_len: u8,
}

impl Cidr {
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let mask = u32::MAX << (32 - self.prefix_len);
        (u32::from(addr) & mask) == (self.network & mask)
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.network), self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip_part, prefix_part) = match s.split_once('/') {
            Some((ip, prefix)) => (ip, prefix),
            None => (s, "32"),
        };
        let ip = Ipv4Addr::from_str(ip_part).map_err(|_| AdmissionError::InvalidCidr(s.to_string()))?;
        let prefix_len: u8 = prefix_part
            .parse()
            .map_err(|_| AdmissionError::InvalidCidr(s.to_string()))?;
        if prefix_len > 32 {
            return Err(AdmissionError::InvalidCidr(s.to_string()));
        }
        Ok(Cidr {
            network: u32::from(ip),
            prefix_len,
        })
    }
}

/// RFC1918 private ranges: 10/8, 172.16/12, 192.168/16.
fn is_rfc1918(addr: Ipv4Addr) -> bool {
    const RANGES: [(u32, u8); 3] = [
        (0x0A000000, 8),  // 10.0.0.0/8
        (0xAC100000, 12), // 172.16.0.0/12
        (0xC0A80000, 16), // 192.168.0.0/16
    ];
    let a = u32::from(addr);
    RANGES.iter().any(|(network, prefix)| {
        let mask = u32::MAX << (32 - prefix);
        (a & mask) == (network & mask)
    })
}

/// Runtime-configurable admission policy (§4.3). Allowed networks and the
/// provider hostname/public IP are configuration, not code.
pub struct AdmissionFilter {
    enabled: RwLock<bool>,
    allowed_networks: RwLock<Vec<Cidr>>,
    public_server_ip: RwLock<Option<Ipv4Addr>>,
    provider_hostname: RwLock<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Accept,
    Reject,
}

impl AdmissionFilter {
    pub fn new(allowed_networks: Vec<Cidr>, public_server_ip: Option<Ipv4Addr>, provider_hostname: Option<String>) -> Self {
        Self {
            enabled: RwLock::new(true),
            allowed_networks: RwLock::new(allowed_networks),
            public_server_ip: RwLock::new(public_server_ip),
            provider_hostname: RwLock::new(provider_hostname),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.write() = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.read()
    }

    pub fn allowed_networks(&self) -> Vec<String> {
        self.allowed_networks.read().iter().map(|c| c.to_string()).collect()
    }

    pub fn set_allowed_networks(&self, networks: Vec<Cidr>) {
        *self.allowed_networks.write() = networks;
    }

    /// Evaluate the admission rules of §4.3 in order, for one inbound INVITE.
    pub fn evaluate(&self, remote_ip: &str, caller_uri: &str) -> AdmissionDecision {
        if !self.is_enabled() {
            return AdmissionDecision::Accept;
        }

        let Ok(addr) = Ipv4Addr::from_str(remote_ip) else {
            return AdmissionDecision::Reject;
        };

        if self.allowed_networks.read().iter().any(|net| net.contains(addr)) {
            return AdmissionDecision::Accept;
        }

        // Rule 3: NAT-traversal exception. Deliberately left as-is even
        // though a LAN-local attacker could spoof the URI to gain admission
        // this way.
        if is_rfc1918(addr) {
            let uri_has_server_ip = self
                .public_server_ip
                .read()
                .map(|ip| caller_uri.contains(&ip.to_string()))
                .unwrap_or(false);
            let uri_has_hostname = self
                .provider_hostname
                .read()
                .as_ref()
                .map(|host| caller_uri.contains(host.as_str()))
                .unwrap_or(false);
            if uri_has_server_ip || uri_has_hostname {
                return AdmissionDecision::Accept;
            }
        }

        AdmissionDecision::Reject
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> AdmissionFilter {
        AdmissionFilter::new(
            vec!["217.10.79.0/24".parse().unwrap()],
            Some("142.132.212.248".parse().unwrap()),
            Some("sipgate.de".to_string()),
        )
    }

    #[test]
    fn allowlisted_ip_is_accepted() {
        let f = filter();
        assert_eq!(
            f.evaluate("217.10.79.9", "sip:+4930123@sipgate.de"),
            AdmissionDecision::Accept
        );
    }

    #[test]
    fn unrelated_ip_is_rejected() {
        let f = filter();
        assert_eq!(
            f.evaluate("203.0.113.5", "sip:spam@attacker"),
            AdmissionDecision::Reject
        );
    }

    #[test]
    fn nat_exception_with_server_ip_in_uri_is_accepted() {
        let f = filter();
        assert_eq!(
            f.evaluate("10.80.4.7", "sip:+4930123@142.132.212.248"),
            AdmissionDecision::Accept
        );
    }

    #[test]
    fn private_ip_without_server_identity_in_uri_is_rejected() {
        let f = filter();
        assert_eq!(
            f.evaluate("10.80.4.7", "sip:spam@attacker"),
            AdmissionDecision::Reject
        );
    }

    #[test]
    fn disabled_filter_accepts_everything() {
        let f = filter();
        f.set_enabled(false);
        assert_eq!(
            f.evaluate("203.0.113.5", "sip:spam@attacker"),
            AdmissionDecision::Accept
        );
    }

    #[test]
    fn cidr_prefix_boundary() {
        let net: Cidr = "192.168.1.0/24".parse().unwrap();
        assert!(net.contains("192.168.1.255".parse().unwrap()));
        assert!(!net.contains("192.168.2.0".parse().unwrap()));
    }
}
