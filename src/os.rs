//! Host OS effects behind one seam.
//!
//! Everything the engines do to the node (files, directories, symlinks,
//! process spawning, signals, unmounts) goes through [`OsInterface`], so
//! the lifecycle logic can be exercised against a recording fake and the
//! real implementation stays a thin pile of syscall wrappers.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;

/// Stdio destinations for [`OsInterface::exec`].
///
/// A `None` entry inherits the parent's descriptor; a path names a file that
/// is created (truncated) and attached to the child.
#[derive(Debug, Clone, Default)]
pub struct ExecStdio {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

impl ExecStdio {
    /// Inherit all three descriptors from the parent.
    pub fn inherit() -> Self {
        ExecStdio::default()
    }
}

/// The host effects used by the sandbox and container engines.
#[tonic::async_trait]
pub trait OsInterface: Send + Sync {
    async fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Create (or truncate) an empty file.
    async fn create(&self, path: &Path) -> io::Result<()>;

    async fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> io::Result<()>;

    async fn read_to_string(&self, path: &Path) -> io::Result<String>;

    async fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Recursively delete a directory tree.
    async fn remove_all(&self, path: &Path) -> io::Result<()>;

    async fn symlink(&self, original: &Path, link: &Path) -> io::Result<()>;

    async fn exists(&self, path: &Path) -> bool;

    fn hostname(&self) -> io::Result<String>;

    /// Spawn `name args…` and return its pid once the child has exited.
    ///
    /// `namespaces` are created for the child before it executes. Stdio is
    /// redirected per `stdio`. A child that exits unsuccessfully is an
    /// error, like a failed wait.
    async fn exec(
        &self,
        name: &str,
        args: &[String],
        namespaces: Option<CloneFlags>,
        stdio: &ExecStdio,
    ) -> io::Result<i32>;

    /// SIGKILL a process and wait until it is gone.
    ///
    /// The target is generally not our child, so "wait" is a bounded poll of
    /// `/proc`. A pid that is already gone is success.
    async fn kill(&self, pid: i32) -> io::Result<()>;

    /// Parent pid of a live process, `None` if the process does not exist.
    async fn ppid_of(&self, pid: i32) -> io::Result<Option<i32>>;

    /// Unmount a filesystem.
    fn unmount(&self, path: &Path) -> io::Result<()>;
}

/// [`OsInterface`] over the real host.
pub struct RealOs;

#[tonic::async_trait]
impl OsInterface for RealOs {
    async fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true).mode(mode);
        builder.create(path).await
    }

    async fn create(&self, path: &Path) -> io::Result<()> {
        tokio::fs::File::create(path).await.map(|_| ())
    }

    async fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true).mode(mode);
        let mut file = options.open(path).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, contents).await
    }

    async fn read_to_string(&self, path: &Path) -> io::Result<String> {
        tokio::fs::read_to_string(path).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn remove_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_dir_all(path).await
    }

    async fn symlink(&self, original: &Path, link: &Path) -> io::Result<()> {
        tokio::fs::symlink(original, link).await
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    fn hostname(&self) -> io::Result<String> {
        let name = nix::unistd::gethostname().map_err(errno_to_io)?;
        Ok(name.to_string_lossy().into_owned())
    }

    async fn exec(
        &self,
        name: &str,
        args: &[String],
        namespaces: Option<CloneFlags>,
        stdio: &ExecStdio,
    ) -> io::Result<i32> {
        let mut command = Command::new(name);
        command.args(args);
        if let Some(path) = &stdio.stdin {
            command.stdin(Stdio::from(redirect_file(path)?));
        }
        if let Some(path) = &stdio.stdout {
            command.stdout(Stdio::from(redirect_file(path)?));
        }
        if let Some(path) = &stdio.stderr {
            command.stderr(Stdio::from(redirect_file(path)?));
        }
        if let Some(flags) = namespaces {
            unsafe {
                command.pre_exec(move || unshare(flags).map_err(errno_to_io));
            }
        }

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .map(|pid| pid as i32)
            .ok_or_else(|| io::Error::other("child exited before its pid was read"))?;
        let status = child.wait().await?;
        if !status.success() {
            return Err(io::Error::other(format!("{name} exited with {status}")));
        }
        Ok(pid)
    }

    async fn kill(&self, pid: i32) -> io::Result<()> {
        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(()),
            Err(errno) => return Err(errno_to_io(errno)),
        }
        for _ in 0..50 {
            if !self.exists(Path::new(&format!("/proc/{pid}"))).await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(io::Error::other(format!("process {pid} survived SIGKILL")))
    }

    async fn ppid_of(&self, pid: i32) -> io::Result<Option<i32>> {
        let stat = match tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await {
            Ok(stat) => stat,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        // The comm field is parenthesised and may itself contain spaces;
        // everything after the final ')' is whitespace-delimited, with the
        // parent pid second.
        let tail = stat
            .rsplit_once(')')
            .map(|(_, tail)| tail)
            .unwrap_or_default();
        let ppid = tail
            .split_whitespace()
            .nth(1)
            .and_then(|field| field.parse::<i32>().ok());
        Ok(ppid)
    }

    fn unmount(&self, path: &Path) -> io::Result<()> {
        nix::mount::umount(path).map_err(errno_to_io)
    }
}

/// Open a stdio redirect target the way the executor expects: read-write,
/// created if missing, truncated, mode 0666.
fn redirect_file(path: &Path) -> io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .open(path)
}

fn errno_to_io(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}
