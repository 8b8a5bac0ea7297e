//! strongswan.conf and swanctl.conf generation

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::VpnctlResult;
use crate::validation;

/// Name of the single swanctl connection
pub const CONNECTION_NAME: &str = "vpn";
/// Name of its single child SA
pub const CHILD_NAME: &str = "managed";
/// Name of the PKCS#11 module entry in strongswan.conf
pub const CRYPTO_MODULE_NAME: &str = "crypto_module";

const LEGACY_IKE_PROPOSALS: &str =
    "aes128-sha256-modp3072,aes128-sha1-modp2048,3des-sha1-modp1536,3des-sha1-modp1024,default";
const LEGACY_ESP_PROPOSALS: &str =
    "aes128gcm16,aes128-sha256,aes128-sha1,3des-sha1,3des-md5,default";

/// Render strongswan.conf for charon
pub fn render_strongswan_conf(crypto_module: &Path, resolv_conf: &Path) -> String {
    format!(
        r#"charon {{
  accept_unencrypted_mainmode_messages = yes
  ignore_routing_tables = 0
  install_routes = no
  install_virtual_ip = no
  routing_table = 0
  syslog {{
    daemon {{
      ike = 2
      cfg = 2
      knl = 2
    }}
  }}
  plugins {{
    pkcs11 {{
      modules {{
        {module} {{
          path = {crypto_module}
        }}
      }}
    }}
    resolve {{
      file = {resolv_conf}
    }}
  }}
}}
"#,
        module = CRYPTO_MODULE_NAME,
        crypto_module = crypto_module.display(),
        resolv_conf = resolv_conf.display(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IkeVersion {
    V1,
    V2,
}

/// Client certificate stored in a PKCS#11 token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCert {
    /// CKA_ID of the certificate, hex
    pub cert_id: String,
    #[serde(default)]
    pub slot: Option<String>,
    #[serde(default)]
    pub pin: Option<String>,
}

/// First authentication round of the local side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalAuth {
    Psk(String),
    Cert(TokenCert),
    /// No first round; the second round authenticates alone
    None,
}

/// Second authentication round: XAUTH for IKEv1, EAP-MSCHAPv2 for IKEv2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondRound {
    pub username: String,
    pub password: String,
}

/// Everything needed to render swanctl.conf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwanctlParams {
    pub ike_version: IkeVersion,
    pub remote: String,
    pub local_id: Option<String>,
    pub remote_id: Option<String>,
    pub local_auth: LocalAuth,
    pub second_round: Option<SecondRound>,
    /// CA certificate files to verify the server with
    pub ca_certs: Vec<String>,
    /// XFRM interface id, set for route-based tunnels
    pub if_id: Option<u32>,
    /// Transport mode protecting L2TP (UDP 1701) only
    pub l2tp_transport: bool,
}

/// One `name { ... }` block of a strongSwan configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigSection {
    name: String,
    entries: Vec<(String, String)>,
    sections: Vec<ConfigSection>,
}

impl ConfigSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn key_value(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.entries.push((key.to_string(), value.into()));
        self
    }

    /// Append a child section and return it for filling in
    pub fn add_section(&mut self, name: impl Into<String>) -> &mut ConfigSection {
        self.sections.push(ConfigSection::new(name));
        let last = self.sections.len() - 1;
        &mut self.sections[last]
    }

    pub fn render(&self, indent: usize, out: &mut String) {
        let pad = " ".repeat(indent);
        out.push_str(&format!("{}{} {{\n", pad, self.name));
        for (key, value) in &self.entries {
            out.push_str(&format!("{}  {} = \"{}\"\n", pad, key, escape(value)));
        }
        for section in &self.sections {
            section.render(indent + 2, out);
        }
        out.push_str(&format!("{}}}\n", pad));
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

impl SwanctlParams {
    fn check(&self) -> VpnctlResult<()> {
        validation::validate_hostname(&self.remote)?;
        let mut values: Vec<&str> = vec![];
        values.extend(self.local_id.as_deref());
        values.extend(self.remote_id.as_deref());
        values.extend(self.ca_certs.iter().map(String::as_str));
        if let Some(round) = &self.second_round {
            values.push(&round.username);
            values.push(&round.password);
        }
        match &self.local_auth {
            LocalAuth::Psk(psk) => values.push(psk),
            LocalAuth::Cert(cert) => {
                values.push(&cert.cert_id);
                values.extend(cert.slot.as_deref());
                values.extend(cert.pin.as_deref());
            }
            LocalAuth::None => {}
        }
        for value in values {
            validation::sanitize_config_value(value)?;
        }
        Ok(())
    }

    fn is_ikev2(&self) -> bool {
        self.ike_version == IkeVersion::V2
    }
}

/// Render swanctl.conf: connection `vpn` with child `managed`, then secrets
pub fn render_swanctl_conf(params: &SwanctlParams) -> VpnctlResult<String> {
    params.check()?;

    let mut connections = ConfigSection::new("connections");
    let conn = connections.add_section(CONNECTION_NAME);
    conn.key_value("local_addrs", "0.0.0.0/0,::/0")
        .key_value("remote_addrs", params.remote.as_str());

    if params.is_ikev2() {
        conn.key_value("proposals", "default").key_value("version", "2");
    } else {
        conn.key_value("proposals", LEGACY_IKE_PROPOSALS).key_value("version", "1");
    }

    if let Some(if_id) = params.if_id {
        conn.key_value("vips", "0.0.0.0,::")
            .key_value("if_id_in", if_id.to_string())
            .key_value("if_id_out", if_id.to_string());
    }

    match &params.local_auth {
        LocalAuth::Psk(_) => {
            let local = conn.add_section("local");
            local.key_value("auth", "psk");
            if let Some(id) = &params.local_id {
                local.key_value("id", id.as_str());
            }
        }
        LocalAuth::Cert(cert) => {
            let local = conn.add_section("local");
            local.key_value("auth", "pubkey");
            if let Some(id) = &params.local_id {
                local.key_value("id", id.as_str());
            }
            let token = local.add_section("cert1");
            token.key_value("handle", cert.cert_id.as_str());
            if let Some(slot) = &cert.slot {
                token.key_value("slot", slot.as_str());
            }
            token.key_value("module", CRYPTO_MODULE_NAME);
        }
        LocalAuth::None => {}
    }

    if let Some(round) = &params.second_round {
        let xauth = conn.add_section("local-xauth");
        if params.is_ikev2() {
            xauth.key_value("auth", "eap-mschapv2")
                .key_value("eap_id", round.username.as_str());
        } else {
            xauth.key_value("auth", "xauth")
                .key_value("xauth_id", round.username.as_str());
        }
    }

    let remote = conn.add_section("remote");
    match params.local_auth {
        LocalAuth::Psk(_) => remote.key_value("auth", "psk"),
        _ => remote.key_value("auth", "pubkey"),
    };
    if let Some(id) = &params.remote_id {
        remote.key_value("id", id.as_str());
    }
    if !params.ca_certs.is_empty() {
        remote.key_value("cacerts", params.ca_certs.join(","));
    }

    let child = conn.add_section("children").add_section(CHILD_NAME);
    if params.l2tp_transport {
        child.key_value("local_ts", "dynamic[17/1701]")
            .key_value("remote_ts", "dynamic[17/1701]")
            .key_value("esp_proposals", LEGACY_ESP_PROPOSALS)
            .key_value("mode", "transport");
    } else {
        let esp = if params.is_ikev2() { "default" } else { LEGACY_ESP_PROPOSALS };
        child.key_value("local_ts", "dynamic")
            .key_value("remote_ts", "0.0.0.0/0,::/0")
            .key_value("esp_proposals", esp)
            .key_value("mode", "tunnel");
    }

    let mut secrets = ConfigSection::new("secrets");
    match &params.local_auth {
        LocalAuth::Psk(psk) => {
            let ike = secrets.add_section("ike-1");
            if let Some(id) = &params.local_id {
                ike.key_value("id-1", id.as_str());
            }
            ike.key_value("secret", psk.as_str());
        }
        LocalAuth::Cert(cert) => {
            let token = secrets.add_section("token-1");
            token.key_value("handle", cert.cert_id.as_str());
            if let Some(slot) = &cert.slot {
                token.key_value("slot", slot.as_str());
            }
            token.key_value("module", CRYPTO_MODULE_NAME);
            if let Some(pin) = &cert.pin {
                token.key_value("pin", pin.as_str());
            }
        }
        LocalAuth::None => {}
    }
    if let Some(round) = &params.second_round {
        let name = if params.is_ikev2() { "eap-1" } else { "xauth-1" };
        secrets
            .add_section(name)
            .key_value("id", round.username.as_str())
            .key_value("secret", round.password.as_str());
    }

    let mut out = String::new();
    connections.render(0, &mut out);
    secrets.render(0, &mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn l2tp_psk() -> SwanctlParams {
        SwanctlParams {
            ike_version: IkeVersion::V1,
            remote: "vpn.example.com".to_string(),
            local_id: None,
            remote_id: None,
            local_auth: LocalAuth::Psk("shared \"secret\"".to_string()),
            second_round: Some(SecondRound {
                username: "alice".to_string(),
                password: "pw".to_string(),
            }),
            ca_certs: vec![],
            if_id: None,
            l2tp_transport: true,
        }
    }

    #[test]
    fn test_strongswan_conf_substitutions() {
        let conf = render_strongswan_conf(
            &PathBuf::from("/usr/lib/libchaps.so"),
            &PathBuf::from("/run/vpn/x/resolv.conf"),
        );
        assert!(conf.starts_with("charon {\n"));
        assert!(conf.contains("        crypto_module {\n          path = /usr/lib/libchaps.so\n"));
        assert!(conf.contains("    resolve {\n      file = /run/vpn/x/resolv.conf\n    }\n"));
    }

    #[test]
    fn test_l2tp_psk_xauth() {
        let conf = render_swanctl_conf(&l2tp_psk()).unwrap();
        let expected = r#"connections {
  vpn {
    local_addrs = "0.0.0.0/0,::/0"
    remote_addrs = "vpn.example.com"
    proposals = "aes128-sha256-modp3072,aes128-sha1-modp2048,3des-sha1-modp1536,3des-sha1-modp1024,default"
    version = "1"
    local {
      auth = "psk"
    }
    local-xauth {
      auth = "xauth"
      xauth_id = "alice"
    }
    remote {
      auth = "psk"
    }
    children {
      managed {
        local_ts = "dynamic[17/1701]"
        remote_ts = "dynamic[17/1701]"
        esp_proposals = "aes128gcm16,aes128-sha256,aes128-sha1,3des-sha1,3des-md5,default"
        mode = "transport"
      }
    }
  }
}
secrets {
  ike-1 {
    secret = "shared \"secret\""
  }
  xauth-1 {
    id = "alice"
    secret = "pw"
  }
}
"#;
        assert_eq!(conf, expected);
        assert_eq!(render_swanctl_conf(&l2tp_psk()).unwrap(), conf);
    }

    #[test]
    fn test_cert_uses_token() {
        let mut params = l2tp_psk();
        params.local_auth = LocalAuth::Cert(TokenCert {
            cert_id: "0a1b".to_string(),
            slot: Some("0".to_string()),
            pin: Some("1234".to_string()),
        });
        params.second_round = None;
        params.ca_certs = vec!["/etc/vpn/ca.pem".to_string()];

        let conf = render_swanctl_conf(&params).unwrap();
        assert!(conf.contains("      auth = \"pubkey\"\n      cert1 {\n        handle = \"0a1b\"\n"));
        assert!(conf.contains("cacerts = \"/etc/vpn/ca.pem\""));
        assert!(conf.contains("  token-1 {\n    handle = \"0a1b\"\n    slot = \"0\"\n    module = \"crypto_module\"\n    pin = \"1234\"\n  }\n"));
        assert!(!conf.contains("local-xauth"));
    }

    #[test]
    fn test_rejects_control_characters() {
        let mut params = l2tp_psk();
        params.local_auth = LocalAuth::Psk("bad\nsecret".to_string());
        assert!(render_swanctl_conf(&params).is_err());

        let mut params = l2tp_psk();
        params.remote = "host name".to_string();
        assert!(render_swanctl_conf(&params).is_err());
    }
}
