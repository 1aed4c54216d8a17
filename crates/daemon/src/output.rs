// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Client Contributors

// VPN Client - Tunnel Output Module
// Extracts network parameters and lifecycle markers from tunnel log lines

const INIT_COMPLETE_MARKER: &str = "Initialization Sequence Completed";
const AUTH_FAILED_MARKER: &str = "AUTH_FAILED";
const PUSH_REPLY_MARKER: &str = "PUSH_REPLY,";
const PEER_MARKER: &str = "Peer Connection Initiated with ";

/// Lifecycle hint found in a line of output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSignal {
    /// The tunnel finished bringing the interface up
    Initialized,
    /// The server rejected the credentials
    AuthFailed,
}

/// Network parameters assigned to the tunnel, accumulated from its output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkParams {
    pub server_addr: Option<String>,
    pub client_addr: Option<String>,
    pub dns_servers: Vec<String>,
    pub search_domains: Vec<String>,
    pub routes: Vec<String>,
}

impl NetworkParams {
    /// Feed one output line; returns a lifecycle signal if the line carries one
    pub fn observe(&mut self, line: &str) -> Option<OutputSignal> {
        if line.contains(INIT_COMPLETE_MARKER) {
            return Some(OutputSignal::Initialized);
        }
        if line.contains(AUTH_FAILED_MARKER) {
            return Some(OutputSignal::AuthFailed);
        }

        if let Some(idx) = line.find(PEER_MARKER) {
            let peer = &line[idx + PEER_MARKER.len()..];
            self.server_addr = Some(strip_address_family(peer.trim()).to_string());
        } else if let Some(idx) = line.find(PUSH_REPLY_MARKER) {
            let options = &line[idx + PUSH_REPLY_MARKER.len()..];
            self.apply_push_reply(options.trim_end_matches(['\'', '"']));
        }

        None
    }

    fn apply_push_reply(&mut self, options: &str) {
        for option in options.split(',') {
            let mut parts = option.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some("dhcp-option"), Some("DNS"), Some(server)) => {
                    push_unique(&mut self.dns_servers, server);
                }
                (Some("dhcp-option"), Some("DOMAIN" | "DOMAIN-SEARCH"), Some(domain)) => {
                    push_unique(&mut self.search_domains, domain);
                }
                (Some("route"), Some(network), mask) => {
                    let route = match mask {
                        Some(mask) => format!("{}/{}", network, mask),
                        None => network.to_string(),
                    };
                    push_unique(&mut self.routes, &route);
                }
                (Some("ifconfig"), Some(local), _) => {
                    self.client_addr = Some(local.to_string());
                }
                _ => {}
            }
        }
    }
}

// "[AF_INET]203.0.113.5:1194" -> "203.0.113.5:1194"
fn strip_address_family(peer: &str) -> &str {
    match peer.strip_prefix('[') {
        Some(rest) => rest.split_once(']').map(|(_, addr)| addr).unwrap_or(peer),
        None => peer,
    }
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    if !values.iter().any(|v| v == value) {
        values.push(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_reply_parsing() {
        let mut params = NetworkParams::default();
        let line = "2025-01-01 10:00:00 PUSH: Received control message: \
            'PUSH_REPLY,redirect-gateway def1,dhcp-option DNS 10.8.0.1,\
            dhcp-option DNS 10.8.0.2,dhcp-option DOMAIN corp.example,\
            route 10.10.0.0 255.255.0.0,topology subnet,ifconfig 10.8.0.6 255.255.255.0,peer-id 0'";

        assert_eq!(params.observe(line), None);
        assert_eq!(params.dns_servers, vec!["10.8.0.1", "10.8.0.2"]);
        assert_eq!(params.search_domains, vec!["corp.example"]);
        assert_eq!(params.routes, vec!["10.10.0.0/255.255.0.0"]);
        assert_eq!(params.client_addr.as_deref(), Some("10.8.0.6"));
    }

    #[test]
    fn test_peer_address() {
        let mut params = NetworkParams::default();
        params.observe("[vpn.example.com] Peer Connection Initiated with [AF_INET]203.0.113.5:1194");
        assert_eq!(params.server_addr.as_deref(), Some("203.0.113.5:1194"));
    }

    #[test]
    fn test_signals() {
        let mut params = NetworkParams::default();
        assert_eq!(
            params.observe("Sat Jan 1 10:00:05 2025 Initialization Sequence Completed"),
            Some(OutputSignal::Initialized)
        );
        assert_eq!(
            params.observe("AUTH: Received control message: AUTH_FAILED"),
            Some(OutputSignal::AuthFailed)
        );
        assert_eq!(params.observe("TUN/TAP device tun0 opened"), None);
    }

    #[test]
    fn test_repeated_push_reply_does_not_duplicate() {
        let mut params = NetworkParams::default();
        let line = "PUSH_REPLY,dhcp-option DNS 1.1.1.1,route 10.0.0.0 255.0.0.0";
        params.observe(line);
        params.observe(line);
        assert_eq!(params.dns_servers.len(), 1);
        assert_eq!(params.routes.len(), 1);
    }
}
