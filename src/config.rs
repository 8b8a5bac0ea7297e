//! Configuration management for vpnctl

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{VpnctlError, VpnctlResult};

/// Main vpnctl configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnctlConfig {
    /// Configuration file paths
    pub paths: ConfigPaths,
    /// Helper program locations
    pub programs: ProgramPaths,
    /// IPsec (charon/swanctl) settings
    pub ipsec: IpsecSettings,
    /// L2TP (xl2tpd/pppd) settings
    pub l2tp: L2tpSettings,
    /// WireGuard settings
    pub wireguard: WireGuardSettings,
    /// Connect timeouts per driver
    pub timeouts: TimeoutSettings,
    /// Sandbox identity for helper processes
    pub sandbox: SandboxSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Base configuration directory (profiles live here)
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Runtime state directory (resolv files for VPN links)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Parent of the per-attempt private temp directories
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramPaths {
    #[serde(default = "default_charon")]
    pub charon: PathBuf,
    #[serde(default = "default_swanctl")]
    pub swanctl: PathBuf,
    #[serde(default = "default_xl2tpd")]
    pub xl2tpd: PathBuf,
    #[serde(default = "default_wg")]
    pub wg: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpsecSettings {
    /// PID file charon writes on startup
    #[serde(default = "default_charon_pid_file")]
    pub charon_pid_file: PathBuf,
    /// vici control socket charon listens on
    #[serde(default = "default_vici_socket")]
    pub vici_socket: PathBuf,
    /// Table of unix sockets used to confirm the listening state
    #[serde(default = "default_proc_net_unix")]
    pub proc_net_unix: PathBuf,
    /// PKCS#11 module substituted into strongswan.conf
    #[serde(default = "default_crypto_module")]
    pub crypto_module: PathBuf,
    /// OpenSSL configuration exported to charon
    #[serde(default = "default_openssl_conf")]
    pub openssl_conf: PathBuf,
    /// Attempts while waiting for a previous charon to terminate
    #[serde(default = "default_pid_poll_attempts")]
    pub pid_poll_attempts: u32,
    /// First backoff interval of the PID poll (doubles each attempt)
    #[serde(default = "default_pid_poll_initial_ms")]
    pub pid_poll_initial_ms: u64,
    /// Attempts while waiting for the vici socket to listen
    #[serde(default = "default_socket_poll_attempts")]
    pub socket_poll_attempts: u32,
    /// Interval between vici socket checks
    #[serde(default = "default_socket_poll_interval_ms")]
    pub socket_poll_interval_ms: u64,
    /// Timeout passed to `swanctl --initiate`
    #[serde(default = "default_initiate_timeout_secs")]
    pub initiate_timeout_secs: u64,
    /// XFRM interface id used by IKEv2 tunnels
    #[serde(default = "default_xfrm_if_id")]
    pub xfrm_if_id: u32,
    /// Name of the XFRM interface
    #[serde(default = "default_xfrm_interface")]
    pub xfrm_interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2tpSettings {
    /// pppd plugin that reports negotiated parameters back over RPC
    #[serde(default = "default_ppp_plugin")]
    pub ppp_plugin: PathBuf,
    /// MTU/MRU requested from pppd
    #[serde(default = "default_mtu_l2tp")]
    pub mtu: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireGuardSettings {
    /// Name of the kernel interface
    #[serde(default = "default_wg_interface")]
    pub interface_name: String,
    /// Firewall mark set on tunnel traffic
    #[serde(default = "default_wg_fwmark")]
    pub fwmark: u32,
    /// Interval between `wg show dump` polls
    #[serde(default = "default_wg_status_interval_secs")]
    pub link_status_interval_secs: u64,
    /// Default MTU of the tunnel
    #[serde(default = "default_mtu_wireguard")]
    pub mtu: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_ipsec_timeout")]
    pub ipsec_connect_secs: u64,
    #[serde(default = "default_wireguard_timeout")]
    pub wireguard_connect_secs: u64,
    #[serde(default = "default_app_tunnel_timeout")]
    pub app_tunnel_connect_secs: u64,
    /// How long a requested interface may take to become ready
    #[serde(default = "default_link_ready_timeout")]
    pub link_ready_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(default = "default_sandbox_user")]
    pub user: String,
    #[serde(default = "default_sandbox_group")]
    pub group: String,
    /// Drop to `user`/`group` when started as root
    #[serde(default)]
    pub switch_identity: bool,
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/crrouter/vpnctl")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/run/crrouter/vpnctl")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/run/crrouter/vpnctl/tmp")
}

fn default_charon() -> PathBuf {
    PathBuf::from("/usr/libexec/ipsec/charon")
}

fn default_swanctl() -> PathBuf {
    PathBuf::from("/usr/sbin/swanctl")
}

fn default_xl2tpd() -> PathBuf {
    PathBuf::from("/usr/sbin/xl2tpd")
}

fn default_wg() -> PathBuf {
    PathBuf::from("/usr/bin/wg")
}

fn default_charon_pid_file() -> PathBuf {
    PathBuf::from("/run/ipsec/charon.pid")
}

fn default_vici_socket() -> PathBuf {
    PathBuf::from("/run/ipsec/charon.vici")
}

fn default_proc_net_unix() -> PathBuf {
    PathBuf::from("/proc/net/unix")
}

fn default_crypto_module() -> PathBuf {
    PathBuf::from("/usr/lib/libchaps.so")
}

fn default_openssl_conf() -> PathBuf {
    PathBuf::from("/etc/ssl/openssl.cnf.compat")
}

fn default_pid_poll_attempts() -> u32 {
    5
}

fn default_pid_poll_initial_ms() -> u64 {
    100
}

fn default_socket_poll_attempts() -> u32 {
    50
}

fn default_socket_poll_interval_ms() -> u64 {
    100
}

fn default_initiate_timeout_secs() -> u64 {
    30
}

fn default_xfrm_if_id() -> u32 {
    1
}

fn default_xfrm_interface() -> String {
    "xfrm-vpn".to_string()
}

fn default_ppp_plugin() -> PathBuf {
    PathBuf::from("/usr/lib/vpnctl/vpnctl-ppp-plugin.so")
}

fn default_mtu_l2tp() -> u32 {
    1410
}

fn default_wg_interface() -> String {
    "wg0".to_string()
}

fn default_wg_fwmark() -> u32 {
    0x3500
}

fn default_wg_status_interval_secs() -> u64 {
    30
}

fn default_mtu_wireguard() -> u32 {
    1420
}

fn default_ipsec_timeout() -> u64 {
    30
}

fn default_wireguard_timeout() -> u64 {
    10
}

fn default_app_tunnel_timeout() -> u64 {
    60
}

fn default_link_ready_timeout() -> u64 {
    10
}

fn default_sandbox_user() -> String {
    "vpn".to_string()
}

fn default_sandbox_group() -> String {
    "vpn".to_string()
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            state_dir: default_state_dir(),
            run_dir: default_run_dir(),
        }
    }
}

impl Default for ProgramPaths {
    fn default() -> Self {
        Self {
            charon: default_charon(),
            swanctl: default_swanctl(),
            xl2tpd: default_xl2tpd(),
            wg: default_wg(),
        }
    }
}

impl Default for IpsecSettings {
    fn default() -> Self {
        Self {
            charon_pid_file: default_charon_pid_file(),
            vici_socket: default_vici_socket(),
            proc_net_unix: default_proc_net_unix(),
            crypto_module: default_crypto_module(),
            openssl_conf: default_openssl_conf(),
            pid_poll_attempts: default_pid_poll_attempts(),
            pid_poll_initial_ms: default_pid_poll_initial_ms(),
            socket_poll_attempts: default_socket_poll_attempts(),
            socket_poll_interval_ms: default_socket_poll_interval_ms(),
            initiate_timeout_secs: default_initiate_timeout_secs(),
            xfrm_if_id: default_xfrm_if_id(),
            xfrm_interface: default_xfrm_interface(),
        }
    }
}

impl Default for L2tpSettings {
    fn default() -> Self {
        Self {
            ppp_plugin: default_ppp_plugin(),
            mtu: default_mtu_l2tp(),
        }
    }
}

impl Default for WireGuardSettings {
    fn default() -> Self {
        Self {
            interface_name: default_wg_interface(),
            fwmark: default_wg_fwmark(),
            link_status_interval_secs: default_wg_status_interval_secs(),
            mtu: default_mtu_wireguard(),
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            ipsec_connect_secs: default_ipsec_timeout(),
            wireguard_connect_secs: default_wireguard_timeout(),
            app_tunnel_connect_secs: default_app_tunnel_timeout(),
            link_ready_secs: default_link_ready_timeout(),
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            user: default_sandbox_user(),
            group: default_sandbox_group(),
            switch_identity: false,
        }
    }
}

impl TimeoutSettings {
    pub fn link_ready(&self) -> Duration {
        Duration::from_secs(self.link_ready_secs)
    }
}

impl VpnctlConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> VpnctlResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| VpnctlError::ConfigError(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| VpnctlError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> VpnctlResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| VpnctlError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| VpnctlError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Ensure all directories exist
    pub fn ensure_directories(&self) -> VpnctlResult<()> {
        for dir in [&self.paths.config_dir, &self.paths.state_dir, &self.paths.run_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| VpnctlError::ConfigError(format!("Failed to create directory {:?}: {}", dir, e)))?;
        }
        Ok(())
    }
}
