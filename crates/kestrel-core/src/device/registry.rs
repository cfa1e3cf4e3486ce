//! Device type discriminator to driver constructor mapping.

use crate::device::disk::DiskDevice;
use crate::device::nic::NicDevice;
use crate::device::none::NoneDevice;
use crate::device::unix_hotplug::UnixHotplugDevice;
use crate::device::{device_type, DeviceConfig, DeviceContext, DeviceDriver};
use crate::error::CoreError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Builds a driver for one named device. Must not touch the host.
pub type DriverConstructor =
    Arc<dyn Fn(DeviceContext, &str, &DeviceConfig) -> Box<dyn DeviceDriver> + Send + Sync>;

/// Types that exist for containers but have no virtual machine driver.
const UNSUPPORTED_TYPES: &[&str] = &["infiniband", "gpu", "unix-char", "unix-block", "proxy"];

/// Driver load failure.
///
/// When construction succeeded but validation failed, `driver` carries the
/// constructed driver so callers can still attempt a best-effort teardown.
pub struct LoadError {
    pub driver: Option<Box<dyn DeviceDriver>>,
    pub error: CoreError,
}

impl LoadError {
    fn fatal(error: CoreError) -> Self {
        Self { driver: None, error }
    }
}

impl fmt::Debug for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadError")
            .field("has_driver", &self.driver.is_some())
            .field("error", &self.error)
            .finish()
    }
}

impl From<LoadError> for CoreError {
    fn from(err: LoadError) -> Self {
        err.error
    }
}

/// Factory registry for device drivers.
#[derive(Clone)]
pub struct DriverRegistry {
    constructors: HashMap<String, DriverConstructor>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.constructors.keys().collect();
        types.sort();
        f.debug_struct("DriverRegistry").field("types", &types).finish()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl DriverRegistry {
    /// Registry with no drivers.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with the built-in virtual machine drivers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("disk", |ctx, name, config| {
            Box::new(DiskDevice::new(ctx, name, config))
        });
        registry.register("nic", |ctx, name, config| {
            Box::new(NicDevice::new(ctx, name, config))
        });
        registry.register("unix-hotplug", |ctx, name, config| {
            Box::new(UnixHotplugDevice::new(ctx, name, config))
        });
        registry.register("none", |_, name, _| Box::new(NoneDevice::new(name)));
        registry
    }

    /// Add or replace the constructor for a type.
    pub fn register<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(DeviceContext, &str, &DeviceConfig) -> Box<dyn DeviceDriver> + Send + Sync + 'static,
    {
        self.constructors
            .insert(kind.to_string(), Arc::new(constructor));
    }

    /// True when a driver exists for the type.
    pub fn supports(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Construct and validate the driver for a device.
    pub fn create(
        &self,
        ctx: DeviceContext,
        name: &str,
        config: &DeviceConfig,
    ) -> Result<Box<dyn DeviceDriver>, LoadError> {
        let kind = device_type(config);
        if kind.is_empty() {
            return Err(LoadError::fatal(CoreError::Validation(format!(
                "device {name:?} has no type"
            ))));
        }

        let Some(constructor) = self.constructors.get(kind) else {
            if UNSUPPORTED_TYPES.contains(&kind) {
                tracing::debug!(device = %name, kind = %kind, "Device type not supported on virtual machines");
            }
            return Err(LoadError::fatal(CoreError::UnsupportedDeviceType(
                kind.to_string(),
            )));
        };

        let driver = constructor(ctx, name, config);
        match driver.validate() {
            Ok(()) => Ok(driver),
            Err(error) => Err(LoadError {
                driver: Some(driver),
                error,
            }),
        }
    }
}
