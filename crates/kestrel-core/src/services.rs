//! Process-wide controller services.
//!
//! Built once at daemon startup and shared by every [`VirtualMachine`].
//! Holds the collaborators plus the two registries that concurrent flows
//! touch: hotplug handlers and active consoles.

use crate::agent::{AgentConnector, VsockConnector};
use crate::backend::{Database, LifecycleEvents, NetworkAssetTracker, StorageBackend};
use crate::config::ControllerConfig;
use crate::console::ConsoleRegistry;
use crate::device::{DriverRegistry, HostNetwork, HostCommands, RunConfig};
use crate::error::Result;
use crate::hotplug::{HotplugEvent, HotplugKey, HotplugRegistry, HotplugTarget};
use crate::instance::DEFAULT_PROJECT;
use crate::vm::VirtualMachine;
use async_trait::async_trait;
use std::sync::Arc;

pub struct Services {
    pub config: ControllerConfig,
    pub database: Arc<dyn Database>,
    pub storage: Arc<dyn StorageBackend>,
    pub network_tracker: Option<Arc<dyn NetworkAssetTracker>>,
    pub events: Arc<dyn LifecycleEvents>,
    pub host_network: Arc<dyn HostNetwork>,
    pub agents: Arc<dyn AgentConnector>,
    pub drivers: DriverRegistry,
    pub hotplug: Arc<HotplugRegistry>,
    pub consoles: ConsoleRegistry,
}

impl Services {
    /// Services with the default drivers, `ip` for host links and vsock for
    /// the agent.
    pub fn new(
        config: ControllerConfig,
        database: Arc<dyn Database>,
        storage: Arc<dyn StorageBackend>,
        events: Arc<dyn LifecycleEvents>,
    ) -> Self {
        let agents = Arc::new(VsockConnector {
            port: config.agent_port,
        });
        Self {
            config,
            database,
            storage,
            network_tracker: None,
            events,
            host_network: Arc::new(HostCommands),
            agents,
            drivers: DriverRegistry::with_defaults(),
            hotplug: Arc::new(HotplugRegistry::new()),
            consoles: ConsoleRegistry::new(),
        }
    }

    /// Sync network assets to an external inventory.
    pub fn with_network_tracker(mut self, tracker: Arc<dyn NetworkAssetTracker>) -> Self {
        self.network_tracker = Some(tracker);
        self
    }

    pub fn with_host_network(mut self, host_network: Arc<dyn HostNetwork>) -> Self {
        self.host_network = host_network;
        self
    }

    pub fn with_agent_connector(mut self, agents: Arc<dyn AgentConnector>) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    /// Load an instance and its profiles from the database.
    pub async fn load_instance(self: &Arc<Self>, project: &str, name: &str) -> Result<VirtualMachine> {
        let project = if project.is_empty() {
            DEFAULT_PROJECT
        } else {
            project
        };
        let args = self.database.instance_get(project, name).await?;
        VirtualMachine::load(self.clone(), args).await
    }

    /// Feed a host uevent to every hotplug registration.
    pub async fn dispatch_hotplug(self: &Arc<Self>, event: &HotplugEvent) -> usize {
        self.hotplug.dispatch(event, self).await
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("config", &self.config)
            .field("drivers", &self.drivers)
            .field("hotplug", &self.hotplug)
            .field("network_tracker", &self.network_tracker.is_some())
            .finish()
    }
}

#[async_trait]
impl HotplugTarget for Arc<Services> {
    async fn handle(&self, key: &HotplugKey, run_conf: RunConfig) -> Result<()> {
        let mut vm = self.load_instance(key.project(), key.instance()).await?;
        vm.device_event_handler(run_conf).await
    }
}
