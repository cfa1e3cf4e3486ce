//! Disk devices: the root filesystem and supplementary drives.

use crate::device::driver::config_bool;
use crate::device::{
    is_root_disk, DeviceConfig, DeviceContext, DeviceDriver, MountEntry, RootFs, RunConfig,
};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::path::PathBuf;

const HOT_FIELDS: &[&str] = &["limits.read", "limits.write", "limits.max", "size"];

pub struct DiskDevice {
    ctx: DeviceContext,
    name: String,
    config: DeviceConfig,
}

impl DiskDevice {
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
}

#[async_trait]
impl DeviceDriver for DiskDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        let Some(path) = self.get("path") else {
            return Err(CoreError::Validation(format!(
                "disk {:?} is missing \"path\"",
                self.name
            )));
        };

        if is_root_disk(&self.config) {
            if self.get("pool").is_none() {
                return Err(CoreError::Validation(format!(
                    "root disk {:?} must have a \"pool\"",
                    self.name
                )));
            }
            return Ok(());
        }

        if !path.starts_with('/') {
            return Err(CoreError::Validation(format!(
                "disk {:?} path must be absolute: {path}",
                self.name
            )));
        }
        if self.get("source").is_none() {
            return Err(CoreError::Validation(format!(
                "disk {:?} is missing \"source\"",
                self.name
            )));
        }
        Ok(())
    }

    fn can_hot_plug(&self) -> (bool, Vec<String>) {
        (false, HOT_FIELDS.iter().map(|f| f.to_string()).collect())
    }

    async fn start(&self) -> Result<RunConfig> {
        let read_only = config_bool(&self.config, "readonly");
        let mut run_conf = RunConfig::default();

        if is_root_disk(&self.config) {
            run_conf.root_fs = Some(RootFs { read_only });
            return Ok(run_conf);
        }

        let source = PathBuf::from(self.get("source").unwrap_or_default());
        if tokio::fs::metadata(&source).await.is_err() {
            return Err(CoreError::NotFound(format!(
                "disk source {} for {:?} on {}",
                source.display(),
                self.name,
                self.ctx.instance
            )));
        }

        tracing::debug!(
            instance = %self.ctx.instance,
            device = %self.name,
            source = %source.display(),
            "Attaching disk"
        );
        run_conf.mounts.push(MountEntry {
            dev_name: self.name.clone(),
            dev_path: source,
            read_only,
        });
        Ok(run_conf)
    }

    async fn stop(&self) -> Result<RunConfig> {
        Ok(RunConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dev;
    use crate::test_support::detached_context;

    fn disk(config: DeviceConfig) -> DiskDevice {
        DiskDevice::new(detached_context(), "d", &config)
    }

    #[test]
    fn test_validate() {
        assert!(disk(dev(&[("type", "disk"), ("path", "/"), ("pool", "p")]))
            .validate()
            .is_ok());
        assert!(disk(dev(&[("type", "disk"), ("path", "/")])).validate().is_err());
        assert!(disk(dev(&[("type", "disk")])).validate().is_err());
        assert!(disk(dev(&[("type", "disk"), ("path", "/srv")])).validate().is_err());
        assert!(disk(dev(&[("type", "disk"), ("path", "srv"), ("source", "/x")]))
            .validate()
            .is_err());
        assert!(disk(dev(&[("type", "disk"), ("path", "/srv"), ("source", "/x")]))
            .validate()
            .is_ok());
    }

    #[tokio::test]
    async fn test_start_root_and_mount() {
        let root = disk(dev(&[("type", "disk"), ("path", "/"), ("pool", "p")]));
        let rc = root.start().await.unwrap();
        assert_eq!(rc.root_fs, Some(RootFs { read_only: false }));
        assert!(rc.mounts.is_empty());

        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("data.img");
        std::fs::write(&image, b"").unwrap();
        let data = disk(dev(&[
            ("type", "disk"),
            ("path", "/srv"),
            ("source", image.to_str().unwrap()),
            ("readonly", "true"),
        ]));
        let rc = data.start().await.unwrap();
        assert_eq!(rc.mounts.len(), 1);
        assert_eq!(rc.mounts[0].dev_path, image);
        assert!(rc.mounts[0].read_only);
    }

    #[tokio::test]
    async fn test_start_missing_source() {
        let data = disk(dev(&[
            ("type", "disk"),
            ("path", "/srv"),
            ("source", "/nonexistent/kestrel/data.img"),
        ]));
        assert!(data.start().await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_not_hot_pluggable() {
        let (hot, fields) = disk(dev(&[("type", "disk")])).can_hot_plug();
        assert!(!hot);
        assert!(fields.contains(&"size".to_string()));
    }
}
