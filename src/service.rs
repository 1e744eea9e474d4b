//! The runtime service: one struct owning every collaborator.
//!
//! The original design kept the KV handle and the readiness map as process
//! globals; here they are explicit collaborators injected at construction.
//! `SobeyService` is built once in `main`, wrapped in an `Arc`, and shared by
//! both gRPC services. The lifecycle operations themselves live with their
//! engines (`sandbox`, `container`, `image`, `runtime`) as `impl` blocks on
//! this type.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ServerConfig;
use crate::container::{LauncherRegistry, SERVER_LOG_DIR};
use crate::error::Result;
use crate::image::SERVER_IMAGE_DIR;
use crate::ipam::IpAllocator;
use crate::network::{NetworkManager, NetworkPlugin};
use crate::os::OsInterface;
use crate::sandbox::{CheckpointStore, SANDBOX_CHECKPOINT_DIR};
use crate::store::KvStore;

/// Kubelet-visible log directory; container log symlinks land underneath.
pub const POD_LOG_DIR: &str = "/var/log/pods";

pub struct SobeyService {
    pub(crate) os: Arc<dyn OsInterface>,
    pub(crate) db: Arc<dyn KvStore>,
    pub(crate) network: NetworkManager,
    pub(crate) ipam: IpAllocator,
    pub(crate) checkpoints: CheckpointStore,
    pub(crate) launchers: LauncherRegistry,
    /// Name of this node; records owned by other nodes are invisible here.
    pub(crate) hostname: String,
    pub(crate) ip_range: String,
    pub(crate) repo: String,
    pub(crate) image_dir: PathBuf,
}

impl SobeyService {
    /// Wire up a service against the real host.
    pub fn new(
        os: Arc<dyn OsInterface>,
        db: Arc<dyn KvStore>,
        plugin: Arc<dyn NetworkPlugin>,
        server: &ServerConfig,
    ) -> anyhow::Result<SobeyService> {
        let hostname = os.hostname()?;
        Ok(SobeyService {
            network: NetworkManager::new(plugin),
            ipam: IpAllocator::new(db.clone()),
            checkpoints: CheckpointStore::new(PathBuf::from(SANDBOX_CHECKPOINT_DIR), os.clone()),
            launchers: LauncherRegistry::with_defaults(os.clone()),
            hostname,
            ip_range: server.ip_range.clone(),
            repo: server.repo.clone(),
            image_dir: PathBuf::from(SERVER_IMAGE_DIR),
            os,
            db,
        })
    }

    /// Persist the allocator CIDR. Called once at startup.
    pub async fn init_ip_range(&self) -> Result<()> {
        self.ipam.init_ip_range(&self.ip_range).await
    }

    /// Create the directory skeleton the engines write into. Failures are
    /// logged; a directory that cannot be created will fail the operation
    /// that needs it later, with better context.
    pub async fn prepare_directories(&self) {
        for dir in [
            SERVER_LOG_DIR,
            SERVER_IMAGE_DIR,
            POD_LOG_DIR,
            SANDBOX_CHECKPOINT_DIR,
        ] {
            if let Err(err) = self.os.mkdir_all(std::path::Path::new(dir), 0o750).await {
                tracing::warn!(dir, error = %err, "cannot create runtime directory");
            }
        }
    }
}

/// Nanoseconds since the epoch, the timestamp unit of every record.
pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or_default()
}
