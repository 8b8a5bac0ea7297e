//! Parsing of `swanctl --list-sas` output and charon's resolv.conf

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::IpAddr;
use tracing::warn;

use crate::metrics::CipherSuite;

/// What the established security associations tell us
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaStatus {
    pub ike: CipherSuite,
    pub esp: CipherSuite,
    pub virtual_ipv4: Option<Ipv4Net>,
    pub virtual_ipv6: Option<Ipv6Net>,
    pub remote_ts: Vec<IpNet>,
}

/// Parse `swanctl --list-sas`
///
/// ```text
/// vpn: #1, ESTABLISHED, IKEv2, 9d3a..._i* 51c2..._r
///   local  'client' @ 192.168.1.2[4500] [10.10.10.2]
///   remote '10.0.0.1' @ 10.0.0.1[4500]
///   AES_CBC-128/HMAC_SHA2_256_128/PRF_HMAC_SHA2_256/MODP_3072
///   established 3s ago, rekeying in 13921s
///   managed: #1, reqid 1, INSTALLED, TUNNEL, ESP:AES_GCM_16-128/MODP_3072
///     installed 3s ago, rekeying in 3301s, expires in 3957s
///     local  10.10.10.2/32
///     remote 0.0.0.0/0
/// ```
pub fn parse_list_sas(output: &str) -> SaStatus {
    let mut status = SaStatus::default();
    let mut in_child = false;
    let mut local_ts: Vec<String> = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let indent = line.len() - line.trim_start().len();

        if indent == 0 {
            in_child = false;
            continue;
        }

        if let Some(pos) = trimmed.find("ESP:") {
            in_child = true;
            let suite = trimmed[pos + 4..]
                .split(|c: char| c.is_whitespace() || c == ',')
                .next()
                .unwrap_or_default();
            status.esp = parse_cipher_suite(suite);
            continue;
        }

        if in_child {
            if let Some(rest) = trimmed.strip_prefix("local ") {
                local_ts.extend(rest.split_whitespace().map(strip_port_selector));
            } else if let Some(rest) = trimmed.strip_prefix("remote ") {
                for token in rest.split_whitespace().map(strip_port_selector) {
                    match token.parse::<IpNet>() {
                        Ok(net) => status.remote_ts.push(net),
                        Err(_) => warn!("Ignoring malformed remote traffic selector '{}'", token),
                    }
                }
            }
            continue;
        }

        // IKE SA cipher line, e.g. AES_CBC-128/HMAC_SHA2_256_128/PRF_.../MODP_3072
        if trimmed.contains('/')
            && !trimmed.starts_with("local ")
            && !trimmed.starts_with("remote ")
            && !trimmed.contains(' ')
        {
            status.ike = parse_cipher_suite(trimmed);
        }
    }

    let (v4, v6) = select_virtual_ips(&local_ts);
    status.virtual_ipv4 = v4;
    status.virtual_ipv6 = v6;
    status
}

/// Drop the `[proto/port]` selector suffix of a traffic selector
fn strip_port_selector(token: &str) -> String {
    match token.find('[') {
        Some(pos) => token[..pos].to_string(),
        None => token.to_string(),
    }
}

/// At most one address per family; any malformed entry or a second address
/// of either family discards both
fn select_virtual_ips(tokens: &[String]) -> (Option<Ipv4Net>, Option<Ipv6Net>) {
    let mut v4 = None;
    let mut v6 = None;

    for token in tokens {
        match token.parse::<IpNet>() {
            Ok(IpNet::V4(net)) if v4.is_none() => v4 = Some(net),
            Ok(IpNet::V6(net)) if v6.is_none() => v6 = Some(net),
            Ok(net) => {
                warn!("More than one local virtual IP of the family of {}", net);
                return (None, None);
            }
            Err(_) => {
                warn!("Malformed local virtual IP '{}'", token);
                return (None, None);
            }
        }
    }
    (v4, v6)
}

/// Classify the slash separated algorithms of a negotiated suite
pub fn parse_cipher_suite(suite: &str) -> CipherSuite {
    let mut parsed = CipherSuite::default();
    for algo in suite.split('/').map(str::trim).filter(|a| !a.is_empty()) {
        if algo.starts_with("PRF_") {
            continue;
        } else if algo.starts_with("HMAC_") || algo.starts_with("AES_XCBC") || algo.starts_with("AES_CMAC") {
            parsed.integrity.get_or_insert_with(|| algo.to_string());
        } else if algo.starts_with("MODP_") || algo.starts_with("ECP_") || algo.starts_with("CURVE_") {
            parsed.dh_group.get_or_insert_with(|| algo.to_string());
        } else {
            parsed.encryption.get_or_insert_with(|| algo.to_string());
        }
    }
    parsed
}

/// Parse the resolv.conf charon writes through the resolve plugin
pub fn parse_resolv_conf(content: &str) -> Vec<IpAddr> {
    let mut servers = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        if fields.next() != Some("nameserver") {
            continue;
        }
        match fields.next().map(str::parse::<IpAddr>) {
            Some(Ok(addr)) => servers.push(addr),
            _ => warn!("Skipping malformed resolv.conf line '{}'", line.trim()),
        }
    }
    servers
}
