//! Virtual interface creation
//!
//! Drivers ask a [`DeviceFactory`] for XFRM, WireGuard and TUN links. The
//! returned future resolves once the link exists and is up.

use crate::error::{ConnectFailure, VpnctlError, VpnctlResult};
use crate::validation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A ready network link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub name: String,
    pub index: u32,
}

#[async_trait]
pub trait DeviceFactory: Send + Sync {
    /// Create an XFRM interface bound to the given `if_id`
    async fn create_xfrm_interface(&self, name: &str, if_id: u32) -> VpnctlResult<LinkInfo>;

    /// Create a kernel WireGuard interface
    async fn create_wireguard_interface(&self, name: &str) -> VpnctlResult<LinkInfo>;

    /// Create a TUN interface
    async fn create_tun_interface(&self, name: &str) -> VpnctlResult<LinkInfo>;

    /// Index of an existing link
    async fn link_index(&self, name: &str) -> Option<u32>;

    /// Delete a link; deleting a missing link is not an error
    async fn delete_interface(&self, name: &str) -> VpnctlResult<()>;
}

/// Wait for a link request, mapping a missing ready notification to
/// `InternalFailure`
pub async fn await_link_ready<F>(request: F, timeout: Duration) -> VpnctlResult<LinkInfo>
where
    F: Future<Output = VpnctlResult<LinkInfo>>,
{
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result,
        Err(_) => Err(VpnctlError::failure(
            ConnectFailure::InternalFailure,
            format!("Link not ready after {:?}", timeout),
        )),
    }
}

/// Factory backed by `ip link` and rtnetlink lookups
pub struct IpLinkFactory {
    poll_interval: Duration,
}

impl IpLinkFactory {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }

    async fn run_ip(&self, args: &[&str]) -> VpnctlResult<()> {
        let cmd_str = format!("ip {}", args.join(" "));
        let output = Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| VpnctlError::CommandFailed {
                cmd: cmd_str.clone(),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(VpnctlError::CommandFailed {
                cmd: cmd_str,
                code: output.status.code(),
                stderr: validation::sanitize_error_message(&String::from_utf8_lossy(&output.stderr)),
            });
        }

        Ok(())
    }

    /// Bring the link up and wait until the kernel reports an index for it
    async fn bring_up(&self, name: &str) -> VpnctlResult<LinkInfo> {
        self.run_ip(&["link", "set", "dev", name, "up"]).await?;

        loop {
            if let Some(index) = self.link_index(name).await {
                info!("Link {} ready (index {})", name, index);
                return Ok(LinkInfo {
                    name: name.to_string(),
                    index,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn creation_failure(name: &str, e: VpnctlError) -> VpnctlError {
        VpnctlError::failure(
            ConnectFailure::InternalFailure,
            format!("Failed to create {}: {}", name, e),
        )
    }
}

impl Default for IpLinkFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceFactory for IpLinkFactory {
    async fn create_xfrm_interface(&self, name: &str, if_id: u32) -> VpnctlResult<LinkInfo> {
        validation::validate_interface_name(name)?;
        let if_id = if_id.to_string();
        self.run_ip(&["link", "add", name, "type", "xfrm", "if_id", &if_id])
            .await
            .map_err(|e| Self::creation_failure(name, e))?;
        self.bring_up(name).await
    }

    async fn create_wireguard_interface(&self, name: &str) -> VpnctlResult<LinkInfo> {
        validation::validate_interface_name(name)?;
        self.run_ip(&["link", "add", "dev", name, "type", "wireguard"])
            .await
            .map_err(|e| Self::creation_failure(name, e))?;
        self.bring_up(name).await
    }

    async fn create_tun_interface(&self, name: &str) -> VpnctlResult<LinkInfo> {
        validation::validate_interface_name(name)?;
        self.run_ip(&["tuntap", "add", "dev", name, "mode", "tun"])
            .await
            .map_err(|e| Self::creation_failure(name, e))?;
        self.bring_up(name).await
    }

    async fn link_index(&self, name: &str) -> Option<u32> {
        match lookup_link_index(name).await {
            Ok(index) => index,
            Err(e) => {
                debug!("rtnetlink lookup of {} failed: {}, reading sysfs", name, e);
                tokio::fs::read_to_string(format!("/sys/class/net/{}/ifindex", name))
                    .await
                    .ok()?
                    .trim()
                    .parse()
                    .ok()
            }
        }
    }

    async fn delete_interface(&self, name: &str) -> VpnctlResult<()> {
        validation::validate_interface_name(name)?;
        if self.link_index(name).await.is_none() {
            debug!("Link {} already gone", name);
            return Ok(());
        }
        if let Err(e) = self.run_ip(&["link", "del", "dev", name]).await {
            warn!("Failed to delete {}: {}", name, e);
            return Err(e);
        }
        info!("Deleted link {}", name);
        Ok(())
    }
}

async fn lookup_link_index(name: &str) -> VpnctlResult<Option<u32>> {
    use futures::stream::TryStreamExt;

    let (connection, handle, _) = rtnetlink::new_connection()
        .map_err(|e| VpnctlError::NotSupported(format!("rtnetlink unavailable: {}", e)))?;
    let task = tokio::spawn(connection);

    let mut links = handle.link().get().match_name(name.to_string()).execute();
    let index = match links.try_next().await {
        Ok(link) => link.map(|l| l.header.index),
        // ENODEV comes back as an error
        Err(rtnetlink::Error::NetlinkError(_)) => None,
        Err(e) => {
            task.abort();
            return Err(VpnctlError::NotSupported(format!("Link query failed: {}", e)));
        }
    };

    task.abort();
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_await_link_ready_times_out() {
        let never = std::future::pending::<VpnctlResult<LinkInfo>>();
        let err = await_link_ready(never, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.connect_failure(), ConnectFailure::InternalFailure);
    }

    #[tokio::test]
    async fn test_await_link_ready_passes_result() {
        let ready = async {
            Ok(LinkInfo {
                name: "xfrm0".to_string(),
                index: 12,
            })
        };
        let link = await_link_ready(ready, Duration::from_secs(5)).await.unwrap();
        assert_eq!(link.index, 12);

        let failing = async {
            Err(VpnctlError::failure(ConnectFailure::ProcessExitedNonZero, "no module"))
        };
        let err = await_link_ready(failing, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.connect_failure(), ConnectFailure::ProcessExitedNonZero);
    }

    #[tokio::test]
    async fn test_rejects_bad_names() {
        let factory = IpLinkFactory::new();
        assert!(factory.create_wireguard_interface("wg0; reboot").await.is_err());
    }
}
