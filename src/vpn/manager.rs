use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::{VpnctlError, VpnctlResult};
use crate::network_config::NetworkConfigSink;
use crate::profile::{DriverConfig, VpnProfile};
use super::app_tunnel::{AppTunnelDriver, AppTunnelHandle};
use super::driver::{DriverContext, VpnDriver, VpnDriverFactory, VpnType};
use super::ipsec::strongswan;
use super::l2tp;
use super::service::VpnService;
use super::wireguard::peers;
use super::{bridge, ikev2, l2tp_ipsec, wireguard};

/// VPN Manager - maps profile types to driver factories and builds services
pub struct VpnManager {
    ctx: DriverContext,
    sink: Arc<dyn NetworkConfigSink>,
    /// Registered driver factories
    drivers: HashMap<VpnType, VpnDriverFactory>,
}

impl VpnManager {
    /// Create a manager without any drivers
    pub fn new(ctx: DriverContext, sink: Arc<dyn NetworkConfigSink>) -> Self {
        Self {
            ctx,
            sink,
            drivers: HashMap::new(),
        }
    }

    /// Create a manager with the built-in drivers registered
    pub fn with_default_drivers(ctx: DriverContext, sink: Arc<dyn NetworkConfigSink>) -> Self {
        let mut manager = Self::new(ctx, sink);
        manager.register_driver(VpnType::Ikev2, ikev2::create_driver);
        manager.register_driver(VpnType::L2tpIpsec, l2tp_ipsec::create_driver);
        manager.register_driver(VpnType::WireGuard, wireguard::create_driver);
        manager.register_driver(VpnType::Bridge, bridge::create_driver);
        manager
    }

    /// Register a VPN driver
    pub fn register_driver(&mut self, vpn_type: VpnType, factory: VpnDriverFactory) {
        info!("Registering VPN driver: {}", vpn_type);
        self.drivers.insert(vpn_type, factory);
    }

    pub fn available_drivers(&self) -> Vec<VpnType> {
        self.drivers.keys().copied().collect()
    }

    pub fn has_driver(&self, vpn_type: VpnType) -> bool {
        self.drivers.contains_key(&vpn_type)
    }

    /// Validate the profile and build its driver
    pub fn create_driver(&self, profile: &VpnProfile) -> VpnctlResult<Box<dyn VpnDriver>> {
        profile.validate()?;
        let vpn_type = profile.vpn_type();
        if vpn_type == VpnType::AppTunnel {
            return Err(VpnctlError::NotSupported(
                "App tunnels are created with create_app_tunnel_service".to_string(),
            ));
        }
        let factory = self
            .drivers
            .get(&vpn_type)
            .ok_or_else(|| VpnctlError::NotSupported(format!("VPN type '{}' not supported", vpn_type)))?;
        factory(&self.ctx, &profile.driver)
    }

    pub fn create_service(&self, profile: &VpnProfile) -> VpnctlResult<VpnService> {
        let driver = self.create_driver(profile)?;
        info!("Created {} service '{}'", profile.vpn_type(), profile.name);
        Ok(VpnService::new(
            profile.name.clone(),
            driver,
            self.sink.clone(),
            self.ctx.metrics.clone(),
        ))
    }

    /// Build an app tunnel service together with the handle the app drives it with
    pub fn create_app_tunnel_service(&self, profile: &VpnProfile) -> VpnctlResult<(VpnService, AppTunnelHandle)> {
        profile.validate()?;
        let DriverConfig::AppTunnel(config) = &profile.driver else {
            return Err(VpnctlError::InvalidParameter(format!(
                "Profile '{}' is a {} profile, not an app tunnel",
                profile.name,
                profile.vpn_type()
            )));
        };

        let handle = AppTunnelHandle::new();
        let driver = AppTunnelDriver::new(self.ctx.clone(), config.clone(), handle.clone());
        let service = VpnService::new(
            profile.name.clone(),
            Box::new(driver),
            self.sink.clone(),
            self.ctx.metrics.clone(),
        );
        Ok((service, handle))
    }

    /// Configuration files a connect attempt would write, by file name
    ///
    /// Secrets in the WireGuard configuration are masked.
    pub fn render_profile(&self, profile: &VpnProfile) -> VpnctlResult<Vec<(String, String)>> {
        profile.validate()?;
        let config = &self.ctx.config;
        let attempt_dir = config.paths.run_dir.join("<attempt>");
        let strongswan_conf = || {
            strongswan::render_strongswan_conf(&config.ipsec.crypto_module, &attempt_dir.join("resolv.conf"))
        };

        let files = match &profile.driver {
            DriverConfig::Ikev2(ikev2) => vec![
                ("strongswan.conf".to_string(), strongswan_conf()),
                (
                    "swanctl.conf".to_string(),
                    strongswan::render_swanctl_conf(&ikev2.swanctl_params(config.ipsec.xfrm_if_id))?,
                ),
            ],
            DriverConfig::L2tpIpsec(l2tp_ipsec) => {
                let pppd_options = attempt_dir.join("pppd.options");
                vec![
                    ("strongswan.conf".to_string(), strongswan_conf()),
                    (
                        "swanctl.conf".to_string(),
                        strongswan::render_swanctl_conf(&l2tp_ipsec.swanctl_params())?,
                    ),
                    (
                        "xl2tpd.conf".to_string(),
                        l2tp::render_xl2tpd_conf(&l2tp_ipsec.l2tp, &l2tp_ipsec.remote, &pppd_options),
                    ),
                    (
                        "pppd.options".to_string(),
                        l2tp::render_pppd_options(&l2tp_ipsec.l2tp, &config.l2tp.ppp_plugin, config.l2tp.mtu),
                    ),
                ]
            }
            DriverConfig::WireGuard(wg) => vec![(
                format!("{}.conf", config.wireguard.interface_name),
                peers::render_config(&mask_key(wg.private_key.as_deref()), config.wireguard.fwmark, &wg.peers),
            )],
            DriverConfig::Bridge(_) | DriverConfig::AppTunnel(_) => {
                return Err(VpnctlError::NotSupported(format!(
                    "{} profiles have no generated configuration",
                    profile.vpn_type()
                )));
            }
        };
        Ok(files)
    }

    /// Load a profile from `config_dir/<name>.toml`
    pub async fn load_profile(&self, name: &str) -> VpnctlResult<VpnProfile> {
        let path = profile_path(&self.ctx.config.paths.config_dir, name);
        VpnProfile::load(&path).await
    }
}

fn mask_key(key: Option<&str>) -> String {
    match key {
        Some(key) if !key.is_empty() => "(hidden)".to_string(),
        _ => "(generated on connect)".to_string(),
    }
}

/// A bare name resolves inside the profile directory; anything with a path
/// separator or extension is used as given
pub fn profile_path(config_dir: &Path, name: &str) -> std::path::PathBuf {
    if name.contains('/') || name.ends_with(".toml") {
        std::path::PathBuf::from(name)
    } else {
        config_dir.join(format!("{}.toml", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_path() {
        let dir = Path::new("/etc/crrouter/vpnctl");
        assert_eq!(profile_path(dir, "office"), dir.join("office.toml"));
        assert_eq!(profile_path(dir, "./office.toml"), Path::new("./office.toml"));
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key(Some("abc")), "(hidden)");
        assert_eq!(mask_key(None), "(generated on connect)");
    }

    fn manager() -> VpnManager {
        use crate::config::VpnctlConfig;
        use crate::device::IpLinkFactory;
        use crate::metrics::TracingMetrics;
        use crate::network_config::IpCommandSink;
        use crate::process::CommandLauncher;

        let config = VpnctlConfig::default();
        let ctx = DriverContext {
            launcher: Arc::new(CommandLauncher::new(config.sandbox.clone())),
            devices: Arc::new(IpLinkFactory::new()),
            metrics: Arc::new(TracingMetrics),
            config: Arc::new(config),
        };
        VpnManager::with_default_drivers(ctx, Arc::new(IpCommandSink::new("/tmp/vpnctl-test")))
    }

    const L2TP_IPSEC: &str = r#"
name = "branch"

[vpn]
type = "l2tp-ipsec"
remote = "203.0.113.1"

[vpn.auth]
method = "psk"
psk = "secret"

[vpn.l2tp]
username = "alice"
password = "secret"
"#;

    #[test]
    fn test_default_drivers() {
        let manager = manager();
        let mut drivers = manager.available_drivers();
        drivers.sort_by_key(|t| t.to_string());
        assert_eq!(
            drivers,
            vec![VpnType::Bridge, VpnType::Ikev2, VpnType::L2tpIpsec, VpnType::WireGuard]
        );
        assert!(!manager.has_driver(VpnType::AppTunnel));
    }

    #[test]
    fn test_render_l2tp_ipsec() {
        let profile = VpnProfile::from_toml(L2TP_IPSEC).unwrap();
        let files = manager().render_profile(&profile).unwrap();
        let names: Vec<&str> = files.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["strongswan.conf", "swanctl.conf", "xl2tpd.conf", "pppd.options"]);
        assert!(files[1].1.contains("mode = \"transport\""));
        assert!(files[2].1.contains("203.0.113.1"));
    }

    #[test]
    fn test_app_tunnel_needs_dedicated_service() {
        let manager = manager();
        let profile = VpnProfile::from_toml("name = \"arc\"\n[vpn]\ntype = \"app-tunnel\"\n").unwrap();

        assert!(matches!(manager.create_service(&profile), Err(VpnctlError::NotSupported(_))));
        let (service, handle) = manager.create_app_tunnel_service(&profile).unwrap();
        assert_eq!(service.vpn_type(), VpnType::AppTunnel);
        assert!(!handle.is_active());

        let other = VpnProfile::from_toml(L2TP_IPSEC).unwrap();
        assert!(manager.create_app_tunnel_service(&other).is_err());
    }
}
