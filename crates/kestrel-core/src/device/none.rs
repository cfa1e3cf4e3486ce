use crate::device::{DeviceDriver, RunConfig};
use crate::error::Result;
use async_trait::async_trait;

/// Masks a device inherited from a profile. Does nothing.
pub struct NoneDevice {
    name: String,
}

impl NoneDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl DeviceDriver for NoneDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn can_hot_plug(&self) -> (bool, Vec<String>) {
        (true, Vec::new())
    }

    async fn start(&self) -> Result<RunConfig> {
        Ok(RunConfig::default())
    }

    async fn stop(&self) -> Result<RunConfig> {
        Ok(RunConfig::default())
    }
}
