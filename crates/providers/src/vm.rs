//! Virtual-machine provider backed by QEMU.
//!
//! Each session owns a qcow2 disk cloned from the configured base image
//! under `<base_dir>/<session_id>.img`, plus a sidecar JSON file recording
//! its forwarded ports so sessions survive coordinator restarts. The VM
//! runs with a user-mode network; SSH (and each declared service) is
//! reached through host-forwarded ports.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::io::AsyncWriteExt,
    tracing::{debug, warn},
};

use {
    crate::{
        CreateConfig, Error, ExecOptions, ExecOutput, Provider, Result, Session, SessionStatus,
        alloc_host_port,
        error::{Context as _, classify_runtime_stderr},
        is_cli_available, session_name,
    },
    dockyard_protocol::SESSION_LABEL,
};

const SHORT_TIMEOUT_SECS: u64 = 30;
const CLONE_TIMEOUT_SECS: u64 = 120;
/// Grace window between `system_powerdown` and a hard terminate.
const SHUTDOWN_GRACE_SECS: u64 = 30;

/// Sidecar metadata persisted beside each disk image.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VmSidecar {
    session_id: String,
    ssh_port: u16,
    service_ports: HashMap<String, u16>,
}

#[derive(Debug, Clone)]
pub struct VmProvider {
    base_dir: PathBuf,
    base_image: Option<PathBuf>,
    cpus: u32,
    memory_mb: u32,
}

impl VmProvider {
    pub fn new(base_dir: PathBuf, base_image: Option<PathBuf>, cpus: u32, memory_mb: u32) -> Self {
        Self {
            base_dir,
            base_image,
            cpus,
            memory_mb,
        }
    }

    fn disk_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.img"))
    }

    fn sidecar_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.json"))
    }

    fn pid_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.pid"))
    }

    fn monitor_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.mon"))
    }

    async fn run(program: &str, args: &[&str], timeout_secs: u64) -> Result<String> {
        let output = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            tokio::process::Command::new(program).args(args).output(),
        )
        .await
        .map_err(|_| Error::TransientRuntime(format!("{program} invocation timed out")))??;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_runtime_stderr(&String::from_utf8_lossy(
                &output.stderr,
            )))
        }
    }

    fn read_sidecar(&self, session_id: &str) -> Result<VmSidecar> {
        let raw = std::fs::read_to_string(self.sidecar_path(session_id))
            .map_err(|_| Error::NotFound(session_id.to_string()))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::FatalRuntime(format!("corrupt vm sidecar for {session_id}: {e}")))
    }

    fn running_pid(&self, session_id: &str) -> Option<u32> {
        let raw = std::fs::read_to_string(self.pid_path(session_id)).ok()?;
        let pid: u32 = raw.trim().parse().ok()?;
        Path::new(&format!("/proc/{pid}")).exists().then_some(pid)
    }

    /// Strip the `dockyard-` session-name prefix if present; VM ids are the
    /// bare session ids on disk.
    fn to_session_id(id: &str) -> &str {
        id.strip_prefix("dockyard-").unwrap_or(id)
    }

    async fn launch(&self, session_id: &str, sidecar: &VmSidecar) -> Result<()> {
        let disk = self.disk_path(session_id);
        if !disk.exists() {
            return Err(Error::NotFound(session_id.to_string()));
        }

        let mut hostfwd = format!("tcp:127.0.0.1:{}-:22", sidecar.ssh_port);
        for port in sidecar.service_ports.values() {
            hostfwd.push_str(&format!(",hostfwd=tcp:127.0.0.1:{port}-:{port}"));
        }

        let memory = self.memory_mb.to_string();
        let cpus = self.cpus.to_string();
        let drive = format!(
            "file={},if=virtio,format=qcow2,cache=none,aio=threads",
            disk.display()
        );
        let netdev = format!("user,id=net0,hostfwd={hostfwd}");
        let pidfile = self.pid_path(session_id);
        let monitor = format!(
            "unix:{},server,nowait",
            self.monitor_path(session_id).display()
        );

        let args = [
            "-name",
            &format!("dockyard-{session_id}"),
            "-machine",
            "accel=kvm:tcg",
            "-m",
            &memory,
            "-smp",
            &cpus,
            "-drive",
            &drive,
            "-netdev",
            &netdev,
            "-device",
            "virtio-net-pci,netdev=net0",
            "-display",
            "none",
            "-daemonize",
            "-pidfile",
            &pidfile.display().to_string(),
            "-monitor",
            &monitor,
        ];
        Self::run("qemu-system-x86_64", &args, CLONE_TIMEOUT_SECS).await?;
        debug!(session = session_id, ssh_port = sidecar.ssh_port, "vm launched");
        Ok(())
    }

    fn session_from_sidecar(&self, sidecar: VmSidecar) -> Session {
        let running = self.running_pid(&sidecar.session_id).is_some();
        Session {
            id: session_name(&sidecar.session_id),
            provider: "vm".into(),
            status: if running {
                SessionStatus::Running
            } else {
                SessionStatus::Stopped
            },
            ssh_port: sidecar.ssh_port,
            services: sidecar.service_ports,
            labels: HashMap::from([(SESSION_LABEL.to_string(), sidecar.session_id)]),
        }
    }
}

#[async_trait]
impl Provider for VmProvider {
    fn name(&self) -> &'static str {
        "vm"
    }

    async fn available(&self) -> bool {
        is_cli_available("qemu-system-x86_64")
            && is_cli_available("qemu-img")
            && self.base_image.as_deref().is_some_and(Path::exists)
    }

    async fn create(
        &self,
        session_id: &str,
        _workspace_path: &Path,
        config: &CreateConfig,
    ) -> Result<Session> {
        let base = self
            .base_image
            .as_deref()
            .ok_or_else(|| Error::ImageUnavailable("no vm base image configured".into()))?;
        std::fs::create_dir_all(&self.base_dir)?;

        let disk = self.disk_path(session_id);
        if disk.exists() {
            return Err(Error::NameInUse(session_id.to_string()));
        }

        Self::run(
            "qemu-img",
            &[
                "create",
                "-f",
                "qcow2",
                "-b",
                &base.display().to_string(),
                "-F",
                "qcow2",
                &disk.display().to_string(),
            ],
            CLONE_TIMEOUT_SECS,
        )
        .await?;

        let mut service_ports = HashMap::new();
        for service in &config.services {
            service_ports.insert(service.name.clone(), alloc_host_port()?);
        }
        let sidecar = VmSidecar {
            session_id: session_id.to_string(),
            ssh_port: alloc_host_port()?,
            service_ports,
        };
        let payload =
            serde_json::to_string_pretty(&sidecar).context("encoding vm sidecar")?;
        std::fs::write(self.sidecar_path(session_id), payload)
            .with_context(|| format!("writing sidecar for {session_id}"))?;

        self.launch(session_id, &sidecar).await?;
        Ok(self.session_from_sidecar(sidecar))
    }

    async fn start(&self, id: &str) -> Result<()> {
        let session_id = Self::to_session_id(id);
        if self.running_pid(session_id).is_some() {
            return Ok(());
        }
        let sidecar = self.read_sidecar(session_id)?;
        self.launch(session_id, &sidecar).await
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let session_id = Self::to_session_id(id);
        let Some(pid) = self.running_pid(session_id) else {
            return Ok(());
        };

        // Graceful ACPI powerdown through the monitor socket first.
        let monitor = self.monitor_path(session_id);
        match tokio::net::UnixStream::connect(&monitor).await {
            Ok(mut stream) => {
                if let Err(e) = stream.write_all(b"system_powerdown\n").await {
                    warn!(session = session_id, error = %e, "monitor write failed");
                }
            },
            Err(e) => warn!(session = session_id, error = %e, "monitor connect failed"),
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(SHUTDOWN_GRACE_SECS);
        while tokio::time::Instant::now() < deadline {
            if self.running_pid(session_id).is_none() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        warn!(session = session_id, pid, "graceful shutdown timed out, terminating");
        Self::run("kill", &["-9", &pid.to_string()], SHORT_TIMEOUT_SECS).await?;
        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        let session_id = Self::to_session_id(id);
        self.stop(id).await?;
        for path in [
            self.disk_path(session_id),
            self.sidecar_path(session_id),
            self.pid_path(session_id),
            self.monitor_path(session_id),
        ] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    async fn exec(&self, id: &str, opts: &ExecOptions) -> Result<ExecOutput> {
        let session_id = Self::to_session_id(id);
        let sidecar = self.read_sidecar(session_id)?;
        if self.running_pid(session_id).is_none() {
            return Err(Error::NotFound(format!("{session_id} is not running")));
        }

        let port = sidecar.ssh_port.to_string();
        let mut args: Vec<String> = vec![
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-p".into(),
            port,
            "root@127.0.0.1".into(),
        ];
        let mut remote = String::new();
        if let Some(dir) = &opts.workdir {
            remote.push_str(&format!("cd {dir} && "));
        }
        for (key, value) in &opts.env {
            remote.push_str(&format!("{key}={value} "));
        }
        remote.push_str(&opts.command.join(" "));
        args.push(remote);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        match Self::run("ssh", &arg_refs, SHORT_TIMEOUT_SECS).await {
            Ok(stdout) => Ok(ExecOutput {
                exit_code: 0,
                stdout: if opts.capture { stdout } else { String::new() },
                stderr: String::new(),
            }),
            Err(Error::FatalRuntime(stderr)) => Ok(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: if opts.capture { stderr } else { String::new() },
            }),
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(sessions),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("img") {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read_sidecar(session_id) {
                Ok(sidecar) => sessions.push(self.session_from_sidecar(sidecar)),
                Err(e) => warn!(session = session_id, error = %e, "skipping vm without sidecar"),
            }
        }
        Ok(sessions)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn provider(dir: &Path) -> VmProvider {
        VmProvider::new(dir.to_path_buf(), Some(dir.join("base.img")), 2, 2048)
    }

    #[test]
    fn paths_are_per_session() {
        let p = provider(Path::new("/var/lib/dockyard/images"));
        assert_eq!(
            p.disk_path("ws1"),
            Path::new("/var/lib/dockyard/images/ws1.img")
        );
        assert_eq!(
            p.sidecar_path("ws1"),
            Path::new("/var/lib/dockyard/images/ws1.json")
        );
    }

    #[test]
    fn session_id_prefix_stripping() {
        assert_eq!(VmProvider::to_session_id("dockyard-ws1"), "ws1");
        assert_eq!(VmProvider::to_session_id("ws1"), "ws1");
    }

    #[tokio::test]
    async fn list_reads_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());

        std::fs::write(dir.path().join("ws1.img"), b"").unwrap();
        let sidecar = VmSidecar {
            session_id: "ws1".into(),
            ssh_port: 40022,
            service_ports: HashMap::from([("web".to_string(), 40080u16)]),
        };
        std::fs::write(
            dir.path().join("ws1.json"),
            serde_json::to_string(&sidecar).unwrap(),
        )
        .unwrap();

        let sessions = p.list().await.unwrap();
        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert_eq!(s.id, "dockyard-ws1");
        assert_eq!(s.status, SessionStatus::Stopped);
        assert_eq!(s.ssh_port, 40022);
        assert_eq!(s.services.get("web"), Some(&40080));
        assert_eq!(s.labels.get(SESSION_LABEL).map(String::as_str), Some("ws1"));
    }

    #[tokio::test]
    async fn destroy_without_disk_reports_missing_sidecar_only() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        // Nothing on disk: stop is a no-op and there are no files to remove.
        p.destroy("ws-missing").await.unwrap();
    }

    #[tokio::test]
    async fn start_unknown_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        match p.start("dockyard-ghost").await {
            Err(Error::NotFound(_)) => {},
            other => panic!("unexpected: {other:?}"),
        }
    }
}
