//! Network interfaces backed by host TAP devices.

use crate::device::{DeviceConfig, DeviceContext, DeviceDriver, Devices, NetworkAttachment, RunConfig};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// Keys a running interface picks up without a restart.
const HOT_FIELDS: &[&str] = &["limits.ingress", "limits.egress", "limits.max"];

/// Units `tc` accepts for a rate.
const RATE_UNITS: &[&str] = &["bit", "kbit", "mbit", "gbit", "tbit"];

const NIC_TYPES: &[&str] = &["bridged", "macvlan", "p2p", "physical"];

/// Host link management used by NIC devices.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Create a TAP device, optionally enslaved to a bridge.
    async fn create_tap(&self, name: &str, bridge: Option<&str>, mtu: Option<u32>) -> Result<()>;

    /// Create a macvtap device on top of `parent`.
    async fn create_macvtap(&self, name: &str, parent: &str, mtu: Option<u32>) -> Result<()>;

    /// Delete a link. Missing links are not an error.
    async fn delete_link(&self, name: &str) -> Result<()>;

    /// Replace the traffic limits on a host link. Rates are from the
    /// guest's point of view; `None` removes that direction's limit.
    async fn set_limits(&self, name: &str, ingress: Option<&str>, egress: Option<&str>)
        -> Result<()>;
}

/// [`HostNetwork`] implementation that shells out to `ip` and `tc`.
#[derive(Debug, Clone, Default)]
pub struct HostCommands;

impl HostCommands {
    async fn exec(&self, program: &str, args: &[&str]) -> Result<()> {
        tracing::trace!(program, args = ?args, "Running host network command");
        let output = Command::new(program).args(args).output().await.map_err(|e| {
            CoreError::ExternalProcess(format!("failed to run {program}: {e}"))
        })?;
        if !output.status.success() {
            return Err(CoreError::ExternalProcess(format!(
                "{program} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        self.exec("ip", args).await
    }

    async fn tc(&self, args: &[&str]) -> Result<()> {
        self.exec("tc", args).await
    }

    async fn set_up(&self, name: &str, mtu: Option<u32>) -> Result<()> {
        if let Some(mtu) = mtu {
            let mtu = mtu.to_string();
            self.run(&["link", "set", "dev", name, "mtu", &mtu]).await?;
        }
        self.run(&["link", "set", "dev", name, "up"]).await
    }
}

#[async_trait]
impl HostNetwork for HostCommands {
    async fn create_tap(&self, name: &str, bridge: Option<&str>, mtu: Option<u32>) -> Result<()> {
        self.run(&["tuntap", "add", "dev", name, "mode", "tap"]).await?;
        if let Some(bridge) = bridge {
            self.run(&["link", "set", "dev", name, "master", bridge]).await?;
        }
        self.set_up(name, mtu).await
    }

    async fn create_macvtap(&self, name: &str, parent: &str, mtu: Option<u32>) -> Result<()> {
        self.run(&[
            "link", "add", "link", parent, "name", name, "type", "macvtap", "mode", "bridge",
        ])
        .await?;
        self.set_up(name, mtu).await
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        let exists = tokio::fs::metadata(format!("/sys/class/net/{name}"))
            .await
            .is_ok();
        if !exists {
            return Ok(());
        }
        self.run(&["link", "delete", "dev", name]).await
    }

    async fn set_limits(
        &self,
        name: &str,
        ingress: Option<&str>,
        egress: Option<&str>,
    ) -> Result<()> {
        // Clearing a qdisc that was never set fails; that is fine.
        let _ = self.tc(&["qdisc", "del", "dev", name, "root"]).await;
        let _ = self.tc(&["qdisc", "del", "dev", name, "ingress"]).await;

        // Guest ingress leaves the host through the link.
        if let Some(rate) = ingress {
            self.tc(&["qdisc", "add", "dev", name, "root", "handle", "1:0", "htb", "default", "10"])
                .await?;
            self.tc(&[
                "class", "add", "dev", name, "parent", "1:0", "classid", "1:10", "htb", "rate",
                rate,
            ])
            .await?;
        }

        // Guest egress arrives on the link and is policed there.
        if let Some(rate) = egress {
            self.tc(&["qdisc", "add", "dev", name, "ingress"]).await?;
            self.tc(&[
                "filter", "add", "dev", name, "parent", "ffff:0", "protocol", "all", "u32",
                "match", "u32", "0", "0", "police", "rate", rate, "burst", "1024k", "mtu",
                "64kb", "drop",
            ])
            .await?;
        }
        Ok(())
    }
}

/// Whether `value` is a rate `tc` understands, e.g. `100Mbit`.
fn valid_rate(value: &str) -> bool {
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    !number.is_empty() && RATE_UNITS.contains(&unit.to_ascii_lowercase().as_str())
}

/// Generate a random MAC address in the `00:16:3e` range.
pub fn random_mac() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    format!("00:16:3e:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

fn valid_mac(value: &str) -> bool {
    let parts: Vec<&str> = value.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

pub struct NicDevice {
    ctx: DeviceContext,
    name: String,
    config: DeviceConfig,
}

impl NicDevice {
    pub fn new(ctx: DeviceContext, name: &str, config: &DeviceConfig) -> Self {
        Self {
            ctx,
            name: name.to_string(),
            config: config.clone(),
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn nic_type(&self) -> &str {
        self.get("nictype").unwrap_or("")
    }

    fn mtu(&self) -> Option<u32> {
        self.get("mtu").and_then(|v| v.parse().ok())
    }

    /// Effective (ingress, egress) rates. `limits.max` sets both.
    fn limits(&self) -> (Option<&str>, Option<&str>) {
        match self.get("limits.max") {
            Some(max) => (Some(max), Some(max)),
            None => (self.get("limits.ingress"), self.get("limits.egress")),
        }
    }
}

#[async_trait]
impl DeviceDriver for NicDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        let nic_type = self.nic_type();
        if !NIC_TYPES.contains(&nic_type) {
            return Err(CoreError::Validation(format!(
                "nic {:?} has invalid nictype {nic_type:?}",
                self.name
            )));
        }
        if nic_type != "p2p" && self.get("parent").is_none() {
            return Err(CoreError::Validation(format!(
                "nic {:?} of type {nic_type} requires \"parent\"",
                self.name
            )));
        }
        if let Some(hwaddr) = self.get("hwaddr") {
            if !valid_mac(hwaddr) {
                return Err(CoreError::Validation(format!(
                    "nic {:?} has invalid hwaddr {hwaddr:?}",
                    self.name
                )));
            }
        }
        for key in HOT_FIELDS {
            if let Some(rate) = self.get(key) {
                if !valid_rate(rate) {
                    return Err(CoreError::Validation(format!(
                        "nic {:?} has invalid {key} {rate:?}",
                        self.name
                    )));
                }
            }
        }
        if let Some(mtu) = self.get("mtu") {
            match mtu.parse::<u32>() {
                Ok(v) if v >= 68 => {}
                _ => {
                    return Err(CoreError::Validation(format!(
                        "nic {:?} has invalid mtu {mtu:?}",
                        self.name
                    )))
                }
            }
        }
        Ok(())
    }

    fn can_hot_plug(&self) -> (bool, Vec<String>) {
        (true, HOT_FIELDS.iter().map(|f| f.to_string()).collect())
    }

    async fn start(&self) -> Result<RunConfig> {
        let volatile = self.ctx.volatile()?;
        let parent = self.get("parent");

        let host_name = if self.nic_type() == "physical" {
            parent.unwrap_or_default().to_string()
        } else {
            let host_name = volatile
                .get()
                .get("host_name")
                .cloned()
                .unwrap_or_else(|| format!("tap{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));

            match self.nic_type() {
                "macvlan" => {
                    self.ctx
                        .host_network
                        .create_macvtap(&host_name, parent.unwrap_or_default(), self.mtu())
                        .await?
                }
                "bridged" => {
                    self.ctx
                        .host_network
                        .create_tap(&host_name, parent, self.mtu())
                        .await?
                }
                _ => {
                    self.ctx
                        .host_network
                        .create_tap(&host_name, None, self.mtu())
                        .await?
                }
            }
            host_name
        };

        volatile.set([("host_name".to_string(), host_name.clone())].into());
        let (ingress, egress) = self.limits();
        if self.nic_type() != "physical" && (ingress.is_some() || egress.is_some()) {
            self.ctx
                .host_network
                .set_limits(&host_name, ingress, egress)
                .await?;
        }
        tracing::debug!(
            instance = %self.ctx.instance,
            device = %self.name,
            host_name = %host_name,
            "Created host interface"
        );

        Ok(RunConfig {
            network: Some(NetworkAttachment {
                name: self.name.clone(),
                host_name,
                hwaddr: self.get("hwaddr").map(str::to_string),
                mtu: self.mtu(),
            }),
            ..Default::default()
        })
    }

    async fn stop(&self) -> Result<RunConfig> {
        let volatile = self.ctx.volatile()?;
        if let Some(host_name) = volatile.get().get("host_name") {
            if self.nic_type() != "physical" {
                self.ctx.host_network.delete_link(host_name).await?;
            }
            volatile.set([("host_name".to_string(), String::new())].into());
        }
        Ok(RunConfig::default())
    }

    async fn update(&self, old_devices: &Devices, running: bool) -> Result<()> {
        // Stopped interfaces pick the new limits up at the next start.
        if !running || self.nic_type() == "physical" {
            return Ok(());
        }
        let limits_changed = match old_devices.get(&self.name) {
            Some(old) => HOT_FIELDS.iter().any(|k| old.get(*k) != self.config.get(*k)),
            None => true,
        };
        if !limits_changed {
            return Ok(());
        }

        let volatile = self.ctx.volatile()?;
        let Some(host_name) = volatile.get().get("host_name").cloned() else {
            tracing::debug!(instance = %self.ctx.instance, device = %self.name, "No host interface to update");
            return Ok(());
        };

        let (ingress, egress) = self.limits();
        self.ctx
            .host_network
            .set_limits(&host_name, ingress, egress)
            .await?;
        tracing::debug!(
            instance = %self.ctx.instance,
            device = %self.name,
            host_name = %host_name,
            ingress = ?ingress,
            egress = ?egress,
            "Updated interface limits"
        );
        Ok(())
    }
}
