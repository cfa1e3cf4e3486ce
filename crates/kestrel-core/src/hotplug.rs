//! Hotplug event registry.
//!
//! Devices that follow host hardware register a handler keyed by
//! (project, instance, device). An external uevent source feeds events to
//! [`HotplugRegistry::dispatch`], which invokes every handler and forwards
//! any resulting [`RunConfig`] to the owning instance through a
//! [`HotplugTarget`].

use crate::device::RunConfig;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Separator used when joining key components. Rejected inside components.
const KEY_SEPARATOR: char = '\0';

/// A host hardware attach/detach event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub action: String,
    pub vendor: String,
    pub product: String,
    /// Device node
    pub path: PathBuf,
    pub major: u32,
    pub minor: u32,
    pub busnum: u32,
    pub devnum: u32,
    /// Raw `KEY=VALUE` uevent lines
    pub uevent_parts: Vec<String>,
}

impl HotplugEvent {
    /// Build an event from its parts.
    ///
    /// The device node is `devname` (under `/dev` when relative) or, when
    /// empty, `/dev/bus/usb/BBB/DDD`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        action: &str,
        vendor: &str,
        product: &str,
        devname: &str,
        busnum: u32,
        devnum: u32,
        major: &str,
        minor: &str,
        uevent_parts: Vec<String>,
    ) -> Result<Self> {
        let path = if devname.is_empty() {
            PathBuf::from(format!("/dev/bus/usb/{busnum:03}/{devnum:03}"))
        } else if devname.starts_with('/') {
            PathBuf::from(devname)
        } else {
            PathBuf::from("/dev").join(devname)
        };

        let number = |field: &str, value: &str| {
            value.parse::<u32>().map_err(|_| {
                CoreError::Validation(format!("invalid {field} number in uevent: {value:?}"))
            })
        };

        Ok(Self {
            action: action.to_string(),
            vendor: vendor.to_ascii_lowercase(),
            product: product.to_ascii_lowercase(),
            path,
            major: number("major", major)?,
            minor: number("minor", minor)?,
            busnum,
            devnum,
            uevent_parts,
        })
    }

    /// Parse raw uevent lines.
    pub fn from_uevent(parts: &[String]) -> Result<Self> {
        let fields: BTreeMap<&str, &str> = parts
            .iter()
            .filter_map(|line| line.split_once('='))
            .collect();
        let get = |k: &str| fields.get(k).copied().unwrap_or("");

        let action = get("ACTION");
        if action.is_empty() {
            return Err(CoreError::Validation("uevent without ACTION".into()));
        }

        // PRODUCT is "vendor/product/revision" in unpadded hex
        let mut product_parts = get("PRODUCT").split('/');
        let from_product = |p: Option<&str>| {
            p.filter(|s| !s.is_empty())
                .map(|s| format!("{s:0>4}"))
                .unwrap_or_default()
        };
        let product_vendor = from_product(product_parts.next());
        let product_model = from_product(product_parts.next());

        let vendor = match get("ID_VENDOR_ID") {
            "" => product_vendor.as_str(),
            v => v,
        };
        let product = match get("ID_MODEL_ID") {
            "" => product_model.as_str(),
            p => p,
        };

        let busnum = get("BUSNUM").parse().unwrap_or(0);
        let devnum = get("DEVNUM").parse().unwrap_or(0);
        let major = match get("MAJOR") {
            "" => "0",
            m => m,
        };
        let minor = match get("MINOR") {
            "" => "0",
            m => m,
        };

        Self::new(
            action,
            vendor,
            product,
            get("DEVNAME"),
            busnum,
            devnum,
            major,
            minor,
            parts.to_vec(),
        )
    }
}

/// Registration key: (project, instance, device).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HotplugKey {
    project: String,
    instance: String,
    device: String,
}

impl HotplugKey {
    pub fn new(project: &str, instance: &str, device: &str) -> Result<Self> {
        for part in [project, instance, device] {
            if part.contains(KEY_SEPARATOR) {
                return Err(CoreError::Validation(format!(
                    "hotplug key component contains NUL: {part:?}"
                )));
            }
        }
        Ok(Self {
            project: project.to_string(),
            instance: instance.to_string(),
            device: device.to_string(),
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

impl fmt::Display for HotplugKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            self.project, self.instance, self.device
        )
    }
}

/// Event callback. Returns `None` for events it does not care about.
pub type HotplugHandler = Arc<dyn Fn(&HotplugEvent) -> Result<Option<RunConfig>> + Send + Sync>;

/// Controller side of the registry: applies a run config to the owning instance.
#[async_trait]
pub trait HotplugTarget: Send + Sync {
    async fn handle(&self, key: &HotplugKey, run_conf: RunConfig) -> Result<()>;
}

/// Process-wide handler map.
#[derive(Default)]
pub struct HotplugRegistry {
    handlers: Mutex<BTreeMap<HotplugKey, HotplugHandler>>,
}

impl fmt::Debug for HotplugRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotplugRegistry")
            .field("registrations", &self.len())
            .finish()
    }
}

impl HotplugRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the handler for a key.
    pub fn register(&self, key: HotplugKey, handler: HotplugHandler) {
        tracing::debug!(
            project = %key.project,
            instance = %key.instance,
            device = %key.device,
            "Registered hotplug handler"
        );
        self.lock().insert(key, handler);
    }

    pub fn unregister(&self, key: &HotplugKey) {
        if self.lock().remove(key).is_some() {
            tracing::debug!(
                project = %key.project,
                instance = %key.instance,
                device = %key.device,
                "Unregistered hotplug handler"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Deliver an event to every registration.
    ///
    /// Handlers run against a snapshot taken under the lock, so they may
    /// register or unregister without deadlocking. Failures are logged and
    /// never stop delivery to the remaining registrations. Returns the number
    /// of run configs applied.
    pub async fn dispatch(&self, event: &HotplugEvent, target: &dyn HotplugTarget) -> usize {
        let snapshot: Vec<(HotplugKey, HotplugHandler)> = self
            .lock()
            .iter()
            .map(|(k, h)| (k.clone(), h.clone()))
            .collect();

        tracing::trace!(
            action = %event.action,
            vendor = %event.vendor,
            product = %event.product,
            handlers = snapshot.len(),
            "Dispatching hotplug event"
        );

        let mut applied = 0;
        for (key, handler) in snapshot {
            let run_conf = match handler(event) {
                Ok(Some(run_conf)) => run_conf,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(
                        project = %key.project,
                        instance = %key.instance,
                        device = %key.device,
                        error = %e,
                        "Hotplug handler failed"
                    );
                    continue;
                }
            };

            match target.handle(&key, run_conf).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!(
                    project = %key.project,
                    instance = %key.instance,
                    device = %key.device,
                    error = %e,
                    "Failed to apply hotplug event"
                ),
            }
        }
        applied
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<HotplugKey, HotplugHandler>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
