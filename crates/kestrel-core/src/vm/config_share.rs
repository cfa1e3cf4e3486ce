//! The config share exported to the guest, and the EFI NVRAM store.

use super::VirtualMachine;
use crate::certs::ensure_certificate_pair;
use crate::error::Result;
use crate::validate::config_flag;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const AGENT_UNIT: &str = "\
[Unit]
Description=kestrel guest agent
ConditionPathExists=/dev/virtio-ports/org.kestrel.agent
Before=cloud-init.target cloud-init.service cloud-init-local.service
DefaultDependencies=no

[Service]
Type=notify
WorkingDirectory=/run/kestrel_agent
ExecStart=/run/kestrel_agent/kestrel-agent
Restart=on-failure
RestartSec=5s
StartLimitInterval=60
StartLimitBurst=10
";

const AGENT_9P_UNIT: &str = "\
[Unit]
Description=kestrel guest agent - 9p mount
ConditionPathExists=/dev/virtio-ports/org.kestrel.agent
After=local-fs.target
DefaultDependencies=no

[Mount]
What=config
Where=/run/kestrel_agent
Type=9p
Options=ro,trans=virtio

[Install]
WantedBy=multi-user.target
";

const INSTALL_SCRIPT: &str = "\
#!/bin/sh
if [ ! -e \"systemd\" ] || [ ! -e \"kestrel-agent\" ]; then
    echo \"This script must be run from within the 9p mount\"
    exit 1
fi

if [ ! -e \"/lib/systemd/system\" ]; then
    echo \"This script only works on systemd systems\"
    exit 1
fi

cp kestrel-agent.service /lib/systemd/system/
cp kestrel-agent-9p.service /lib/systemd/system/
systemctl daemon-reload
systemctl enable kestrel-agent.service kestrel-agent-9p.service

echo \"\"
echo \"kestrel agent has been installed, reboot to confirm setup.\"
echo \"To start it now, unmount this filesystem and run: systemctl start kestrel-agent-9p kestrel-agent\"
";

const DEFAULT_CLOUD_CONFIG: &str = "#cloud-config\n";

impl VirtualMachine {
    /// Regenerate `<path>/config`, the directory the guest mounts to find
    /// its agent, TLS material and cloud-init data.
    pub(crate) async fn generate_config_share(&self) -> Result<()> {
        let share = self.path().join("config");
        match tokio::fs::remove_dir_all(&share).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&share).await?;
        tokio::fs::set_permissions(&share, std::fs::Permissions::from_mode(0o700)).await?;

        // The host's client certificate is what the agent trusts.
        let client = ensure_certificate_pair(&self.path(), "agent-client", &self.args.name).await?;
        let agent = ensure_certificate_pair(&self.path(), "agent", &self.args.name).await?;
        write_file(&share.join("server.crt"), &client.cert, 0o400).await?;
        write_file(&share.join("agent.crt"), &agent.cert, 0o400).await?;
        write_file(&share.join("agent.key"), &agent.key, 0o400).await?;

        match which::which(&self.services.config.agent_binary) {
            Ok(binary) => {
                let target = share.join("kestrel-agent");
                tokio::fs::copy(&binary, &target).await?;
                tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))
                    .await?;
            }
            Err(e) => {
                tracing::warn!(
                    instance = %self.args.name,
                    agent = %self.services.config.agent_binary,
                    error = %e,
                    "Agent binary not found, guest will run without it"
                );
            }
        }

        let systemd = share.join("systemd");
        tokio::fs::create_dir_all(&systemd).await?;
        write_file(&systemd.join("kestrel-agent.service"), AGENT_UNIT, 0o400).await?;
        write_file(&systemd.join("kestrel-agent-9p.service"), AGENT_9P_UNIT, 0o400).await?;
        write_file(&share.join("install.sh"), INSTALL_SCRIPT, 0o700).await?;

        let cloud_init = share.join("cloud-init");
        tokio::fs::create_dir_all(&cloud_init).await?;
        let user_data = self.cloud_init_value("cloud-init.user-data", "user.user-data");
        let vendor_data = self.cloud_init_value("cloud-init.vendor-data", "user.vendor-data");
        write_file(
            &cloud_init.join("user-data"),
            user_data.unwrap_or(DEFAULT_CLOUD_CONFIG),
            0o400,
        )
        .await?;
        write_file(
            &cloud_init.join("vendor-data"),
            vendor_data.unwrap_or(DEFAULT_CLOUD_CONFIG),
            0o400,
        )
        .await?;
        if let Some(network) =
            self.cloud_init_value("cloud-init.network-config", "user.network-config")
        {
            write_file(&cloud_init.join("network-config"), network, 0o400).await?;
        }

        let mut meta_data = format!(
            "instance-id: {}\nlocal-hostname: {}\n",
            self.args.name, self.args.name
        );
        if let Some(extra) = self.expanded_config.get("user.meta-data") {
            meta_data.push_str(extra);
            meta_data.push('\n');
        }
        write_file(&cloud_init.join("meta-data"), &meta_data, 0o400).await?;

        tracing::debug!(instance = %self.args.name, path = %share.display(), "Config share generated");
        Ok(())
    }

    fn cloud_init_value(&self, key: &str, legacy: &str) -> Option<&str> {
        self.expanded_config
            .get(key)
            .or_else(|| self.expanded_config.get(legacy))
            .map(String::as_str)
    }

    /// Create the per-instance EFI variable store from the firmware
    /// template. An existing store is kept unless `force` is set.
    pub(crate) async fn setup_nvram(&self, force: bool) -> Result<()> {
        let target = self.nvram_path();
        if !force && target.exists() {
            return Ok(());
        }

        let secure_boot = !self.expanded_config.contains_key("security.secureboot")
            || config_flag(&self.expanded_config, "security.secureboot");
        let template = if secure_boot {
            "OVMF_VARS.ms.fd"
        } else {
            "OVMF_VARS.fd"
        };

        tokio::fs::create_dir_all(self.path()).await?;
        let source = self.services.config.ovmf_path.join(template);
        tokio::fs::copy(&source, &target).await?;
        tracing::debug!(
            instance = %self.args.name,
            template = %template,
            "NVRAM store created"
        );
        Ok(())
    }
}

async fn write_file(path: &Path, content: &str, mode: u32) -> Result<()> {
    tokio::fs::write(path, content).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}
