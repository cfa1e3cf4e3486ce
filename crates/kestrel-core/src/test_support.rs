//! In-memory collaborators and fixtures for unit tests.

use crate::agent::{
    AgentClient, AgentConnector, AgentCredentials, ControlStream, ExecRequest, ExecSession,
    FileContent, FileInfo, FilePush, GuestState,
};
use crate::backend::{
    Database, LifecycleEvents, NetworkAssetTracker, StorageBackend, StoragePool, TrackedInterface,
};
use crate::config::{ControllerConfig, DEFAULT_AGENT_PORT};
use crate::device::{dev, DeviceContext, Devices, HostNetwork};
use crate::error::{CoreError, Result};
use crate::expand::Profile;
use crate::hotplug::HotplugRegistry;
use crate::instance::{ConfigMap, InstanceArgs, InstanceRef, DEFAULT_PROJECT};
use crate::services::Services;
use crate::vm::VirtualMachine;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kestrel_vm::qemu_config::CONSOLE_CHARDEV;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

/// Context with no volatile access and a recording host network.
pub(crate) fn detached_context() -> DeviceContext {
    DeviceContext::detached(
        InstanceRef {
            id: 1,
            project: DEFAULT_PROJECT.into(),
            name: "vm1".into(),
            snapshot: false,
        },
        ConfigMap::new(),
        Arc::new(HotplugRegistry::new()),
        Arc::new(RecordingNetwork::default()),
        PathBuf::from("/nonexistent/usb"),
    )
}

/// Instance record with only a root disk on the `default` pool.
pub(crate) fn instance_args(name: &str) -> InstanceArgs {
    let mut devices = Devices::new();
    devices.insert(
        "root",
        dev(&[("type", "disk"), ("path", "/"), ("pool", "default")]),
    );
    InstanceArgs {
        project: DEFAULT_PROJECT.into(),
        name: name.into(),
        architecture: "x86_64".into(),
        devices,
        ..Default::default()
    }
}

/// Host network that records calls instead of touching links.
#[derive(Debug, Default)]
pub(crate) struct RecordingNetwork {
    calls: Mutex<Vec<String>>,
}

impl RecordingNetwork {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl HostNetwork for RecordingNetwork {
    async fn create_tap(&self, name: &str, bridge: Option<&str>, _mtu: Option<u32>) -> Result<()> {
        lock(&self.calls).push(format!("create_tap {name} {}", bridge.unwrap_or("-")));
        Ok(())
    }

    async fn create_macvtap(&self, name: &str, parent: &str, _mtu: Option<u32>) -> Result<()> {
        lock(&self.calls).push(format!("create_macvtap {name} {parent}"));
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        lock(&self.calls).push(format!("delete_link {name}"));
        Ok(())
    }

    async fn set_limits(
        &self,
        name: &str,
        ingress: Option<&str>,
        egress: Option<&str>,
    ) -> Result<()> {
        lock(&self.calls).push(format!(
            "set_limits {name} {} {}",
            ingress.unwrap_or("-"),
            egress.unwrap_or("-")
        ));
        Ok(())
    }
}

#[derive(Default)]
struct DbState {
    next_id: i64,
    instances: BTreeMap<String, InstanceArgs>,
    profiles: BTreeMap<String, Profile>,
    volumes: BTreeSet<String>,
    backups: BTreeMap<String, Vec<String>>,
    conflicts: u32,
    fail_instance_update: bool,
}

impl DbState {
    fn by_id(&mut self, id: i64) -> Result<&mut InstanceArgs> {
        self.instances
            .values_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("instance id {id}")))
    }
}

/// Database keyed by instance name; every test lives in one project.
#[derive(Default)]
pub(crate) struct MemoryDatabase {
    state: Mutex<DbState>,
}

impl MemoryDatabase {
    /// Instance and snapshot rows live in separate tables; an id is only
    /// found through the update that matches its kind.
    fn apply_config(&self, id: i64, snapshot: bool, changes: &ConfigMap) -> Result<()> {
        let mut state = lock(&self.state);
        if state.conflicts > 0 {
            state.conflicts -= 1;
            return Err(CoreError::TransientConflict("database is locked".into()));
        }
        let args = state.by_id(id)?;
        if args.snapshot != snapshot {
            let kind = if snapshot { "snapshot" } else { "instance" };
            return Err(CoreError::NotFound(format!("{kind} id {id}")));
        }
        for (key, value) in changes {
            if value.is_empty() {
                args.config.remove(key);
            } else {
                args.config.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    pub fn insert(&self, mut args: InstanceArgs) -> InstanceArgs {
        let mut state = lock(&self.state);
        if args.id == 0 {
            state.next_id += 1;
            args.id = state.next_id;
        }
        state.instances.insert(args.name.clone(), args.clone());
        args
    }

    pub fn record(&self, name: &str) -> InstanceArgs {
        lock(&self.state).instances[name].clone()
    }

    pub fn has_instance(&self, name: &str) -> bool {
        lock(&self.state).instances.contains_key(name)
    }

    pub fn config_of(&self, id: i64) -> ConfigMap {
        lock(&self.state)
            .by_id(id)
            .map(|a| a.config.clone())
            .unwrap_or_default()
    }

    /// Fail the next `n` config writes with a transient conflict.
    pub fn inject_conflicts(&self, n: u32) {
        lock(&self.state).conflicts = n;
    }

    pub fn fail_instance_update(&self, fail: bool) {
        lock(&self.state).fail_instance_update = fail;
    }

    pub fn add_profile(&self, profile: Profile) {
        lock(&self.state)
            .profiles
            .insert(profile.name.clone(), profile);
    }

    pub fn add_volume(&self, pool: &str, name: &str) {
        lock(&self.state).volumes.insert(format!("{pool}/{name}"));
    }

    pub fn volumes(&self) -> Vec<String> {
        lock(&self.state).volumes.iter().cloned().collect()
    }

    pub fn add_backup(&self, instance: &str, backup: &str) {
        lock(&self.state)
            .backups
            .entry(instance.to_string())
            .or_default()
            .push(backup.to_string());
    }

    pub fn backups(&self) -> Vec<String> {
        lock(&self.state).backups.values().flatten().cloned().collect()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn instance_get(&self, _project: &str, name: &str) -> Result<InstanceArgs> {
        lock(&self.state)
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("instance {name}")))
    }

    async fn instance_snapshots(&self, _project: &str, name: &str) -> Result<Vec<InstanceArgs>> {
        let prefix = format!("{name}/");
        Ok(lock(&self.state)
            .instances
            .values()
            .filter(|a| a.snapshot && a.name.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn profiles(&self, _project: &str, names: &[String]) -> Result<Vec<Profile>> {
        let state = lock(&self.state);
        names
            .iter()
            .map(|n| {
                state
                    .profiles
                    .get(n)
                    .cloned()
                    .ok_or_else(|| CoreError::NotFound(format!("profile {n}")))
            })
            .collect()
    }

    async fn instance_pool(&self, _project: &str, name: &str) -> Result<String> {
        let state = lock(&self.state);
        let args = state
            .instances
            .get(name)
            .ok_or_else(|| CoreError::NotFound(format!("instance {name}")))?;
        let (_, root) = args.devices.root_disk()?;
        Ok(root.get("pool").cloned().unwrap_or_default())
    }

    async fn volume_create(&self, _project: &str, pool: &str, name: &str, _snapshot: bool) -> Result<()> {
        self.add_volume(pool, name);
        Ok(())
    }

    async fn volume_delete(&self, _project: &str, pool: &str, name: &str, _snapshot: bool) -> Result<()> {
        lock(&self.state).volumes.remove(&format!("{pool}/{name}"));
        Ok(())
    }

    async fn instance_backups(&self, _project: &str, name: &str) -> Result<Vec<String>> {
        Ok(lock(&self.state)
            .backups
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn backup_remove(&self, name: &str) -> Result<()> {
        for list in lock(&self.state).backups.values_mut() {
            list.retain(|b| b != name);
        }
        Ok(())
    }

    async fn instance_remove(&self, _project: &str, name: &str) -> Result<()> {
        lock(&self.state).instances.remove(name);
        Ok(())
    }

    async fn config_update(&self, id: i64, changes: &ConfigMap) -> Result<()> {
        self.apply_config(id, false, changes)
    }

    async fn snapshot_config_update(&self, id: i64, changes: &ConfigMap) -> Result<()> {
        self.apply_config(id, true, changes)
    }

    async fn config_get(&self, id: i64) -> Result<ConfigMap> {
        Ok(lock(&self.state).by_id(id)?.config.clone())
    }

    async fn instance_update(&self, args: &InstanceArgs) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_instance_update {
            return Err(CoreError::Database("injected failure".into()));
        }
        *state.by_id(args.id)? = args.clone();
        Ok(())
    }

    async fn snapshot_update(
        &self,
        id: i64,
        description: &str,
        expiry_date: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        let args = state.by_id(id)?;
        args.description = description.to_string();
        args.expiry_date = expiry_date;
        Ok(())
    }
}

/// Pool that counts mounts and records deletions.
pub(crate) struct MemoryPool {
    name: String,
    root: PathBuf,
    mounted: Mutex<i64>,
    deleted: Mutex<Vec<String>>,
}

impl MemoryPool {
    fn new(name: &str, root: PathBuf) -> Self {
        Self {
            name: name.into(),
            root,
            mounted: Mutex::new(0),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn mounted(&self) -> i64 {
        *lock(&self.mounted)
    }

    pub fn set_mounted(&self, n: i64) {
        *lock(&self.mounted) = n;
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }
}

#[async_trait]
impl StoragePool for MemoryPool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mount_instance(&self, _instance: &InstanceRef) -> Result<bool> {
        *lock(&self.mounted) += 1;
        Ok(true)
    }

    async fn unmount_instance(&self, _instance: &InstanceRef) -> Result<bool> {
        let mut mounted = lock(&self.mounted);
        *mounted = (*mounted - 1).max(0);
        Ok(true)
    }

    async fn instance_disk_path(&self, instance: &InstanceRef) -> Result<PathBuf> {
        Ok(self.root.join(instance.storage_name()))
    }

    async fn delete_instance(&self, instance: &InstanceRef) -> Result<()> {
        lock(&self.deleted).push(format!("instance {instance}"));
        Ok(())
    }

    async fn delete_instance_snapshot(&self, instance: &InstanceRef) -> Result<()> {
        lock(&self.deleted).push(format!("snapshot {instance}"));
        Ok(())
    }
}

/// `default` resolves to the pool, `broken` has an unknown driver.
struct MemoryStorage {
    pool: Arc<MemoryPool>,
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn pool(&self, name: &str) -> Result<Arc<dyn StoragePool>> {
        match name {
            "default" => Ok(self.pool.clone()),
            "broken" => Err(CoreError::UnknownStorageDriver("zfs-legacy".into())),
            other => Err(CoreError::NotFound(format!("storage pool {other}"))),
        }
    }
}

#[derive(Default)]
pub(crate) struct RecordingTracker {
    assets: Mutex<BTreeMap<String, Vec<TrackedInterface>>>,
}

impl RecordingTracker {
    /// `<asset> <iface>=<mac>[<subnets>] ...`
    pub fn assets(&self) -> Vec<String> {
        lock(&self.assets)
            .iter()
            .map(|(name, ifaces)| {
                let ifaces: Vec<String> = ifaces
                    .iter()
                    .map(|i| format!("{}={}[{}]", i.name, i.mac_address, i.subnets.join(",")))
                    .collect();
                format!("{name} {}", ifaces.join(" "))
            })
            .collect()
    }
}

#[async_trait]
impl NetworkAssetTracker for RecordingTracker {
    async fn defined(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.assets).contains_key(name))
    }

    async fn create(&self, name: &str, interfaces: &[TrackedInterface]) -> Result<()> {
        lock(&self.assets).insert(name.to_string(), interfaces.to_vec());
        Ok(())
    }

    async fn update(&self, name: &str, interfaces: &[TrackedInterface]) -> Result<()> {
        lock(&self.assets).insert(name.to_string(), interfaces.to_vec());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        lock(&self.assets).remove(name);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingEvents {
    sent: Mutex<Vec<String>>,
}

impl RecordingEvents {
    /// `<action> <source>`
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }
}

impl LifecycleEvents for RecordingEvents {
    fn send(&self, _project: &str, action: &str, source: &str) {
        lock(&self.sent).push(format!("{action} {source}"));
    }
}

#[derive(Default)]
struct AgentState {
    files: BTreeMap<String, FileContent>,
    exec_script: Option<(Vec<u8>, Vec<u8>, i32)>,
    last_exec: Option<ExecRequest>,
    unreachable: bool,
}

/// Agent and connector in one. Every instance shares the same fake guest.
#[derive(Clone, Default)]
pub(crate) struct FakeAgent {
    state: Arc<Mutex<AgentState>>,
}

impl FakeAgent {
    /// Output and exit code of the next exec.
    pub fn script_exec(&self, stdout: &[u8], stderr: &[u8], code: i32) {
        lock(&self.state).exec_script = Some((stdout.to_vec(), stderr.to_vec(), code));
    }

    pub fn last_exec(&self) -> Option<ExecRequest> {
        lock(&self.state).last_exec.clone()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }
}

#[async_trait]
impl AgentConnector for FakeAgent {
    async fn connect(
        &self,
        _instance: &InstanceRef,
        _cid: u32,
        _credentials: AgentCredentials,
    ) -> Result<Arc<dyn AgentClient>> {
        if lock(&self.state).unreachable {
            return Err(CoreError::Connection("agent unreachable".into()));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn file_pull(&self, path: &str) -> Result<FileContent> {
        lock(&self.state)
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(path.to_string()))
    }

    async fn file_push(&self, path: &str, file: &FilePush) -> Result<()> {
        lock(&self.state).files.insert(
            path.to_string(),
            FileContent {
                content: file.content.clone(),
                info: file.info.clone(),
            },
        );
        Ok(())
    }

    async fn file_stat(&self, path: &str) -> Result<FileInfo> {
        self.file_pull(path).await.map(|f| f.info)
    }

    async fn exec(&self, request: &ExecRequest) -> Result<ExecSession> {
        let (stdout, stderr, code) = {
            let mut state = lock(&self.state);
            state.last_exec = Some(request.clone());
            state.exec_script.take().unwrap_or((Vec::new(), Vec::new(), 0))
        };
        let exit = format!("{{\"command\":\"exit\",\"return\":{code}}}\n");
        Ok(ExecSession {
            stdin: Some(Box::new(tokio::io::sink())),
            stdout: Some(Box::new(Cursor::new(stdout))),
            stderr: Some(Box::new(Cursor::new(stderr))),
            control: ControlStream::new(
                Box::new(Cursor::new(exit.into_bytes())),
                Box::new(tokio::io::sink()),
            ),
        })
    }

    async fn state(&self) -> Result<GuestState> {
        Ok(GuestState {
            processes: 7,
            network: BTreeMap::new(),
        })
    }
}

/// QMP server on an instance's monitor socket.
///
/// Reports `running` until it receives `system_powerdown` (unless told to
/// ignore it) or `quit`, then closes the socket.
pub(crate) struct FakeMonitor {
    task: JoinHandle<()>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl FakeMonitor {
    async fn spawn(
        socket: PathBuf,
        console: PathBuf,
        honour_powerdown: bool,
        status: &'static str,
    ) -> Self {
        if let Some(parent) = socket.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        let _ = tokio::fs::remove_file(&socket).await;
        let listener = UnixListener::bind(&socket).unwrap();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let recorded = commands.clone();
        let task = tokio::spawn(async move {
            let stop_tx = Arc::new(stop_tx);
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        tokio::spawn(serve_qmp(
                            stream,
                            console.clone(),
                            honour_powerdown,
                            status,
                            recorded.clone(),
                            stop_tx.clone(),
                        ));
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            drop(listener);
            let _ = tokio::fs::remove_file(&socket).await;
        });

        Self { task, commands }
    }

    /// Commands received after negotiation, excluding status queries.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }
}

impl Drop for FakeMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_qmp(
    stream: UnixStream,
    console: PathBuf,
    honour_powerdown: bool,
    status: &'static str,
    commands: Arc<Mutex<Vec<String>>>,
    stop: Arc<watch::Sender<bool>>,
) {
    let (r, mut w) = stream.into_split();
    let mut reader = BufReader::new(r);
    if w
        .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
        .await
        .is_err()
    {
        return;
    }

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let request: serde_json::Value = match serde_json::from_str(line.trim()) {
            Ok(v) => v,
            Err(_) => return,
        };
        let command = request["execute"].as_str().unwrap_or_default().to_string();

        let (reply, stop_after) = match command.as_str() {
            "qmp_capabilities" => (serde_json::json!({ "return": {} }), false),
            "query-status" => (
                serde_json::json!({ "return": { "status": status, "running": status == "running" } }),
                false,
            ),
            "query-chardev" => (
                serde_json::json!({ "return": [
                    { "label": "monitor", "filename": "unix:qemu.monitor" },
                    { "label": CONSOLE_CHARDEV, "filename": format!("pty:{}", console.display()) },
                ]}),
                false,
            ),
            "system_powerdown" => (serde_json::json!({ "return": {} }), honour_powerdown),
            "quit" => (serde_json::json!({ "return": {} }), true),
            "device_add" | "device_del" | "netdev_add" => {
                (serde_json::json!({ "return": {} }), false)
            }
            other => (
                serde_json::json!({ "error": { "class": "CommandNotFound", "desc": format!("unknown command {other}") } }),
                false,
            ),
        };

        if !matches!(command.as_str(), "qmp_capabilities" | "query-status") {
            let arguments = request
                .get("arguments")
                .map(|a| format!(" {a}"))
                .unwrap_or_default();
            lock(&commands).push(format!("{command}{arguments}"));
        }

        let mut out = reply.to_string();
        out.push('\n');
        if w.write_all(out.as_bytes()).await.is_err() {
            return;
        }
        if stop_after {
            let _ = stop.send(true);
            return;
        }
    }
}

/// Temp directories, in-memory collaborators and [`Services`] wired
/// together.
pub(crate) struct TestEnv {
    pub dir: tempfile::TempDir,
    pub db: Arc<MemoryDatabase>,
    pub pool: Arc<MemoryPool>,
    pub tracker: Arc<RecordingTracker>,
    pub events: Arc<RecordingEvents>,
    pub network: Arc<RecordingNetwork>,
    pub agent: Arc<FakeAgent>,
    pub services: Arc<Services>,
}

impl TestEnv {
    /// Hypervisor binary points at a path that does not exist.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Hypervisor binary is a shell script with the given body.
    pub fn with_qemu_script(body: &str) -> Self {
        Self::build(Some(body))
    }

    fn build(script: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let ovmf = root.join("ovmf");
        std::fs::create_dir_all(&ovmf).unwrap();
        std::fs::write(ovmf.join("OVMF_CODE.fd"), b"code").unwrap();
        std::fs::write(ovmf.join("OVMF_VARS.fd"), b"plain vars").unwrap();
        std::fs::write(ovmf.join("OVMF_VARS.ms.fd"), b"secure vars").unwrap();

        let usb = root.join("usb");
        std::fs::create_dir_all(&usb).unwrap();

        let qemu_binary = match script {
            Some(body) => {
                let bin = root.join("bin");
                std::fs::create_dir_all(&bin).unwrap();
                let path = bin.join("qemu-system-test");
                std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
                path.to_string_lossy().into_owned()
            }
            None => "/nonexistent/qemu-system".to_string(),
        };

        let config = ControllerConfig {
            var_dir: root.join("var"),
            log_dir: root.join("log"),
            ovmf_path: ovmf,
            agent_binary: "kestrel-agent-absent-in-tests".into(),
            poll_interval: Duration::from_millis(10),
            monitor_timeout: Duration::from_millis(200),
            kernel_modules: Vec::new(),
            qemu_binary: Some(qemu_binary),
            usb_sysfs_path: usb,
            agent_port: DEFAULT_AGENT_PORT,
        };

        let db = Arc::new(MemoryDatabase::default());
        let pool = Arc::new(MemoryPool::new("default", root.join("disks")));
        let tracker = Arc::new(RecordingTracker::default());
        let events = Arc::new(RecordingEvents::default());
        let network = Arc::new(RecordingNetwork::default());
        let agent = Arc::new(FakeAgent::default());

        let services = Services::new(
            config,
            db.clone(),
            Arc::new(MemoryStorage { pool: pool.clone() }),
            events.clone(),
        )
        .with_network_tracker(tracker.clone())
        .with_host_network(network.clone())
        .with_agent_connector(agent.clone());

        Self {
            dir,
            db,
            pool,
            tracker,
            events,
            network,
            agent,
            services: Arc::new(services),
        }
    }

    /// Store a record, assigning an id.
    pub fn insert(&self, args: InstanceArgs) -> InstanceArgs {
        self.db.insert(args)
    }

    /// Store a snapshot record copied from its parent.
    pub fn insert_snapshot(&self, parent: &str, snapshot: &str) -> InstanceArgs {
        let mut args = self.db.record(parent);
        args.id = 0;
        args.name = format!("{parent}/{snapshot}");
        args.snapshot = true;
        self.insert(args)
    }

    pub async fn vm(&self, name: &str) -> VirtualMachine {
        self.vm_with(instance_args(name)).await
    }

    pub async fn vm_with(&self, args: InstanceArgs) -> VirtualMachine {
        let args = self.insert(args);
        VirtualMachine::load(self.services.clone(), args)
            .await
            .unwrap()
    }

    /// A USB device visible in the sysfs tree the controller scans.
    pub fn fake_usb(&self, dir: &str, vendor: &str, product: &str, bus: u32, devnum: u32) {
        let path = self.services.config.usb_sysfs_path.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("idVendor"), format!("{vendor}\n")).unwrap();
        std::fs::write(path.join("idProduct"), format!("{product}\n")).unwrap();
        std::fs::write(path.join("busnum"), format!("{bus}\n")).unwrap();
        std::fs::write(path.join("devnum"), format!("{devnum}\n")).unwrap();
    }

    /// A regular file usable as a disk source.
    pub fn disk_image(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    fn console_file(&self, vm: &VirtualMachine) -> PathBuf {
        let path = self.dir.path().join(format!("console-{}", vm.id()));
        std::fs::write(&path, b"").unwrap();
        path
    }

    pub async fn fake_monitor(&self, vm: &VirtualMachine) -> FakeMonitor {
        FakeMonitor::spawn(vm.monitor_path(), self.console_file(vm), true, "running").await
    }

    /// A control channel reporting `status` for every run state query.
    pub async fn fake_monitor_with_status(
        &self,
        vm: &VirtualMachine,
        status: &'static str,
    ) -> FakeMonitor {
        FakeMonitor::spawn(vm.monitor_path(), self.console_file(vm), true, status).await
    }

    /// Like [`TestEnv::fake_monitor`] but the guest never powers off.
    pub async fn fake_monitor_ignoring_powerdown(&self, vm: &VirtualMachine) -> FakeMonitor {
        FakeMonitor::spawn(vm.monitor_path(), self.console_file(vm), false, "running").await
    }
}
