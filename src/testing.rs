//! Shared test doubles: an in-memory KV store, a recording fake OS, a fake
//! network plugin and an instant launcher, plus a fixture that wires them
//! into a fully constructed service.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nix::sched::CloneFlags;
use tonic::Status;

use crate::api::{
    ContainerConfig, ContainerMetadata, CreateContainerRequest, DnsConfig, ImageSpec, Mount,
    PodSandboxConfig, PodSandboxMetadata, RunPodSandboxRequest,
};
use crate::container::{AppLauncher, LauncherRegistry, SobeyContainer};
use crate::error::Result;
use crate::ipam::IpAllocator;
use crate::network::{NetworkManager, NetworkPlugin, PodNetwork};
use crate::os::{ExecStdio, OsInterface};
use crate::sandbox::{CheckpointStore, CriParam, SobeySandbox, CRI_PARAM_ANNOTATION,
    SANDBOX_CHECKPOINT_DIR};
use crate::service::SobeyService;
use crate::store::KvStore;

const CRI_PARAM_JSON: &str = r#"{"appType":"jar","imageName":"nginx","imageTag":"1.25"}"#;

// ---------------------------------------------------------------------------
// In-memory KV store.
// ---------------------------------------------------------------------------

pub(crate) struct MemoryStore {
    data: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        MemoryStore {
            data: Mutex::new(BTreeMap::new()),
        }
    }
}

#[tonic::async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    async fn get_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, value)| value.clone())
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: Option<&str>,
    ) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        if data.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        match value {
            Some(new) => data.insert(key.to_string(), new.to_string()),
            None => data.remove(key),
        };
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Recording fake OS.
// ---------------------------------------------------------------------------

pub(crate) struct FakeOs {
    hostname: String,
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    execs: Mutex<Vec<(String, Vec<String>, Option<CloneFlags>)>>,
    symlinks: Mutex<Vec<(PathBuf, PathBuf)>>,
    removed_files: Mutex<Vec<PathBuf>>,
    removed_trees: Mutex<Vec<PathBuf>>,
    unmounted: Mutex<Vec<PathBuf>>,
    kills: Mutex<Vec<i32>>,
    ppids: Mutex<HashMap<i32, i32>>,
    next_pid: AtomicI32,
}

impl FakeOs {
    pub(crate) fn new(hostname: &str) -> Self {
        FakeOs {
            hostname: hostname.to_string(),
            files: Mutex::new(HashMap::new()),
            execs: Mutex::new(Vec::new()),
            symlinks: Mutex::new(Vec::new()),
            removed_files: Mutex::new(Vec::new()),
            removed_trees: Mutex::new(Vec::new()),
            unmounted: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
            ppids: Mutex::new(HashMap::new()),
            next_pid: AtomicI32::new(4242),
        }
    }

    pub(crate) fn put_file(&self, path: &Path, contents: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), contents.to_vec());
    }

    pub(crate) fn written_file(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub(crate) fn execs(&self) -> Vec<(String, Vec<String>, Option<CloneFlags>)> {
        self.execs.lock().unwrap().clone()
    }

    pub(crate) fn symlinks(&self) -> Vec<(PathBuf, PathBuf)> {
        self.symlinks.lock().unwrap().clone()
    }

    pub(crate) fn removed_file(&self, path: &Path) -> bool {
        self.removed_files.lock().unwrap().iter().any(|p| p == path)
    }

    pub(crate) fn removed_tree(&self, path: &Path) -> bool {
        self.removed_trees.lock().unwrap().iter().any(|p| p == path)
    }

    pub(crate) fn unmounts(&self) -> Vec<PathBuf> {
        self.unmounted.lock().unwrap().clone()
    }

    pub(crate) fn killed(&self) -> Vec<i32> {
        self.kills.lock().unwrap().clone()
    }

    pub(crate) fn set_ppid(&self, pid: i32, parent: i32) {
        self.ppids.lock().unwrap().insert(pid, parent);
    }
}

#[tonic::async_trait]
impl OsInterface for FakeOs {
    async fn mkdir_all(&self, _path: &Path, _mode: u32) -> io::Result<()> {
        Ok(())
    }

    async fn create(&self, path: &Path) -> io::Result<()> {
        self.put_file(path, b"");
        Ok(())
    }

    async fn write_file(&self, path: &Path, contents: &[u8], _mode: u32) -> io::Result<()> {
        self.put_file(path, contents);
        Ok(())
    }

    async fn read_to_string(&self, path: &Path) -> io::Result<String> {
        match self.files.lock().unwrap().get(path) {
            Some(contents) => Ok(String::from_utf8_lossy(contents).into_owned()),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such fake file")),
        }
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        if self.files.lock().unwrap().remove(path).is_none() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such fake file"));
        }
        self.removed_files.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    async fn remove_all(&self, path: &Path) -> io::Result<()> {
        self.files
            .lock()
            .unwrap()
            .retain(|file, _| !file.starts_with(path));
        self.removed_trees.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    async fn symlink(&self, original: &Path, link: &Path) -> io::Result<()> {
        self.symlinks
            .lock()
            .unwrap()
            .push((original.to_path_buf(), link.to_path_buf()));
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn hostname(&self) -> io::Result<String> {
        Ok(self.hostname.clone())
    }

    async fn exec(
        &self,
        name: &str,
        args: &[String],
        namespaces: Option<CloneFlags>,
        _stdio: &ExecStdio,
    ) -> io::Result<i32> {
        self.execs
            .lock()
            .unwrap()
            .push((name.to_string(), args.to_vec(), namespaces));
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    async fn kill(&self, pid: i32) -> io::Result<()> {
        self.kills.lock().unwrap().push(pid);
        Ok(())
    }

    async fn ppid_of(&self, pid: i32) -> io::Result<Option<i32>> {
        Ok(self.ppids.lock().unwrap().get(&pid).copied())
    }

    fn unmount(&self, path: &Path) -> io::Result<()> {
        self.unmounted.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake network plugin.
// ---------------------------------------------------------------------------

pub(crate) struct FakeNetworkPlugin {
    fail_setup: AtomicBool,
    setups: Mutex<Vec<String>>,
    teardowns: AtomicUsize,
}

impl FakeNetworkPlugin {
    pub(crate) fn new() -> Self {
        FakeNetworkPlugin {
            fail_setup: AtomicBool::new(false),
            setups: Mutex::new(Vec::new()),
            teardowns: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_setup(&self) {
        self.fail_setup.store(true, Ordering::SeqCst);
    }

    pub(crate) fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub(crate) fn setups(&self) -> Vec<String> {
        self.setups.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl NetworkPlugin for FakeNetworkPlugin {
    async fn set_up_pod(&self, pod: &PodNetwork) -> Result<()> {
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(Status::internal("fake network setup failure"));
        }
        self.setups.lock().unwrap().push(pod.sandbox_id.clone());
        Ok(())
    }

    async fn tear_down_pod(&self, _pod: &PodNetwork) -> Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn pod_ip(&self, _sandbox_id: &str) -> Result<String> {
        Ok("10.0.0.1".to_string())
    }
}

// ---------------------------------------------------------------------------
// Fake launcher.
// ---------------------------------------------------------------------------

pub(crate) struct FakeLauncher {
    starts: AtomicUsize,
}

impl FakeLauncher {
    pub(crate) fn new() -> Self {
        FakeLauncher {
            starts: AtomicUsize::new(0),
        }
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[tonic::async_trait]
impl AppLauncher for FakeLauncher {
    async fn start(
        &self,
        _container: &SobeyContainer,
        _sandbox: &SobeySandbox,
        _param: &CriParam,
    ) -> Result<String> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok("7777".to_string())
    }
}

// ---------------------------------------------------------------------------
// Fixture.
// ---------------------------------------------------------------------------

pub(crate) struct Fixture {
    pub(crate) service: SobeyService,
    pub(crate) db: Arc<MemoryStore>,
    pub(crate) os: Arc<FakeOs>,
    pub(crate) network: Arc<FakeNetworkPlugin>,
    pub(crate) launcher: Arc<FakeLauncher>,
}

pub(crate) fn fixture() -> Fixture {
    let db = Arc::new(MemoryStore::new());
    let os = Arc::new(FakeOs::new("node-1"));
    let network = Arc::new(FakeNetworkPlugin::new());
    let launcher = Arc::new(FakeLauncher::new());

    let mut launchers = LauncherRegistry::new();
    launchers.register("jar", launcher.clone());

    let service = SobeyService {
        os: os.clone(),
        db: db.clone(),
        network: NetworkManager::new(network.clone()),
        ipam: IpAllocator::new(db.clone()),
        checkpoints: CheckpointStore::new(PathBuf::from(SANDBOX_CHECKPOINT_DIR), os.clone()),
        launchers,
        hostname: "node-1".to_string(),
        ip_range: "10.0.0.0/24".to_string(),
        repo: "http://127.0.0.1:1".to_string(),
        image_dir: PathBuf::from("/var/lib/sobey/images"),
    };

    Fixture {
        service,
        db,
        os,
        network,
        launcher,
    }
}

/// A fixture with the IP range initialised, ready to run sandboxes.
pub(crate) async fn ready_fixture() -> Fixture {
    let fixture = fixture();
    fixture.service.init_ip_range().await.unwrap();
    fixture
}

impl Fixture {
    pub(crate) async fn run_sandbox(&self, name: &str, namespace: &str, uid: &str) -> String {
        self.service
            .run_pod_sandbox(RunPodSandboxRequest {
                config: Some(sandbox_config(name, namespace, uid)),
                runtime_handler: String::new(),
            })
            .await
            .unwrap()
            .pod_sandbox_id
    }

    pub(crate) async fn create_container(&self, sandbox_id: &str, image: &str) -> String {
        let sandbox = self
            .service
            .load_sandbox(sandbox_id)
            .await
            .unwrap()
            .expect("sandbox must exist before creating a container");
        self.service
            .create_container(CreateContainerRequest {
                pod_sandbox_id: sandbox_id.to_string(),
                config: Some(container_config("nginx", image)),
                sandbox_config: sandbox.config,
            })
            .await
            .unwrap()
            .container_id
    }
}

pub(crate) fn sandbox_config(name: &str, namespace: &str, uid: &str) -> PodSandboxConfig {
    PodSandboxConfig {
        metadata: Some(PodSandboxMetadata {
            name: name.to_string(),
            uid: uid.to_string(),
            namespace: namespace.to_string(),
            attempt: 0,
        }),
        hostname: String::new(),
        log_directory: format!("/var/log/pods/{name}_{uid}"),
        dns_config: Some(DnsConfig {
            servers: vec!["10.0.0.10".to_string()],
            searches: Vec::new(),
            options: Vec::new(),
        }),
        port_mappings: Vec::new(),
        labels: HashMap::from([("app".to_string(), name.to_string())]),
        annotations: HashMap::from([(
            CRI_PARAM_ANNOTATION.to_string(),
            CRI_PARAM_JSON.to_string(),
        )]),
        linux: None,
    }
}

pub(crate) fn container_config(name: &str, image: &str) -> ContainerConfig {
    ContainerConfig {
        metadata: Some(ContainerMetadata {
            name: name.to_string(),
            attempt: 0,
        }),
        image: Some(ImageSpec {
            image: image.to_string(),
            annotations: HashMap::new(),
        }),
        command: Vec::new(),
        args: Vec::new(),
        working_dir: String::new(),
        envs: Vec::new(),
        mounts: vec![Mount {
            container_path: "/data/sobey/media".to_string(),
            host_path: "/srv/media".to_string(),
            readonly: false,
        }],
        labels: HashMap::from([("app".to_string(), name.to_string())]),
        annotations: HashMap::from([(
            CRI_PARAM_ANNOTATION.to_string(),
            CRI_PARAM_JSON.to_string(),
        )]),
        log_path: format!("{name}/0.log"),
        linux: None,
    }
}
