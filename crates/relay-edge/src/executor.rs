use async_trait::async_trait;
use relay_core::config::EdgeConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::{EdgeError, Result};

const STATUS_MARKER: &str = "status:";
const STATUS_OK: &str = "0x0";

/// Applies a desired on/off state to one device.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    async fn apply(&self, device_id: &str, on: bool) -> Result<()>;
}

// ─── CommandExecutor ──────────────────────────────────────────────────────

/// Runs `<program> [args..] <device-id> <1|0>` with a hard timeout.
///
/// Stdout and stderr are scanned for `status: <code>` lines; any code other
/// than `0x0` fails the run. The per-device scratch file
/// `temp-<device-id>.txt` in the working directory is removed on every exit
/// path, and removal errors are ignored.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    work_dir: PathBuf,
}

impl CommandExecutor {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            work_dir: PathBuf::from("."),
        }
    }

    pub fn from_config(cfg: &EdgeConfig) -> Self {
        Self::new(cfg.command.clone(), cfg.command_timeout())
            .with_args(cfg.command_args.clone())
            .with_work_dir(cfg.work_dir.clone())
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn execute(&self, device_id: &str, on: bool) -> Result<()> {
        let state = if on { "1" } else { "0" };
        info!(device_id, state, "running device command");

        let result = self.run(device_id, state).await;
        self.cleanup(device_id);
        result
    }

    async fn run(&self, device_id: &str, state: &str) -> Result<()> {
        let program = self.resolved_program();
        let mut child = Command::new(&program)
            .args(&self.args)
            .arg(device_id)
            .arg(state)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EdgeError::Spawn { program, source })?;

        let output = match tokio::time::timeout(self.timeout, collect_output(&mut child)).await {
            Ok(output) => output?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(device_id, error = %e, "failed to kill timed-out command");
                }
                return Err(EdgeError::Timeout(self.timeout));
            }
        };

        for line in output.lines.iter() {
            debug!(device_id, "{line}");
        }
        if !output.success {
            return Err(EdgeError::Exit(output.code.unwrap_or(-1)));
        }
        match failed_status(&output.lines) {
            Some(status) => Err(EdgeError::Status(status)),
            None => Ok(()),
        }
    }

    /// A relative program with a directory part runs from the working
    /// directory; a bare name goes through `PATH`.
    fn resolved_program(&self) -> PathBuf {
        let has_dir = self.program.components().count() > 1;
        if self.program.is_relative() && has_dir {
            self.work_dir.join(&self.program)
        } else {
            self.program.clone()
        }
    }

    fn cleanup(&self, device_id: &str) {
        if let Some(path) = scratch_file(&self.work_dir, device_id) {
            if std::fs::remove_file(&path).is_ok() {
                debug!(path = %path.display(), "removed scratch file");
            }
        }
    }
}

#[async_trait]
impl DeviceDriver for CommandExecutor {
    async fn apply(&self, device_id: &str, on: bool) -> Result<()> {
        self.execute(device_id, on).await
    }
}

// ─── Output handling ──────────────────────────────────────────────────────

struct CommandOutput {
    lines: Vec<String>,
    success: bool,
    code: Option<i32>,
}

async fn collect_output(child: &mut Child) -> Result<CommandOutput> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (out, err) = tokio::join!(read_all(stdout), read_all(stderr));
    let status = child.wait().await?;

    let mut lines: Vec<String> = out?.lines().map(str::to_owned).collect();
    lines.extend(err?.lines().map(str::to_owned));
    Ok(CommandOutput {
        lines,
        success: status.success(),
        code: status.code(),
    })
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut r) = reader {
        r.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// First status code that is not `0x0`, taken as the last token of any line
/// carrying the status marker.
fn failed_status(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .filter(|line| line.contains(STATUS_MARKER))
        .filter_map(|line| line.split_whitespace().last())
        .find(|code| *code != STATUS_OK)
        .map(str::to_owned)
}

/// `None` for ids that would escape the working directory.
fn scratch_file(work_dir: &Path, device_id: &str) -> Option<PathBuf> {
    if device_id.is_empty() || device_id.contains(['/', '\\']) || device_id.contains("..") {
        return None;
    }
    Some(work_dir.join(format!("temp-{device_id}.txt")))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Executor running `sh <dir>/device.sh <id> <state>` from `dir`.
    fn script(dir: &TempDir, body: &str, timeout: Duration) -> CommandExecutor {
        let path = dir.path().join("device.sh");
        std::fs::write(&path, body).unwrap();
        CommandExecutor::new("/bin/sh", timeout)
            .with_args(vec![path.to_string_lossy().into_owned()])
            .with_work_dir(dir.path())
    }

    #[test]
    fn status_scan_picks_first_failure() {
        let lines = vec![
            "CHIP:DMG: status: 0x0".to_string(),
            "noise".to_string(),
            "CHIP:DMG: status: 0x1".to_string(),
        ];
        assert_eq!(failed_status(&lines).as_deref(), Some("0x1"));
        assert_eq!(failed_status(&lines[..2]), None);
    }

    #[test]
    fn scratch_file_rejects_path_escapes() {
        let dir = Path::new("/tmp/edge");
        assert_eq!(
            scratch_file(dir, "13"),
            Some(PathBuf::from("/tmp/edge/temp-13.txt"))
        );
        assert_eq!(scratch_file(dir, "../13"), None);
        assert_eq!(scratch_file(dir, "a/b"), None);
        assert_eq!(scratch_file(dir, ""), None);
    }

    #[test]
    fn relative_program_resolves_against_work_dir() {
        let exec = CommandExecutor::new("./script.sh", Duration::from_secs(1)).with_work_dir("/opt/edge");
        assert_eq!(exec.resolved_program(), PathBuf::from("/opt/edge/./script.sh"));
        let bare = CommandExecutor::new("chip-tool", Duration::from_secs(1)).with_work_dir("/opt/edge");
        assert_eq!(bare.resolved_program(), PathBuf::from("chip-tool"));
    }

    #[tokio::test]
    async fn success_status_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let exec = script(
            &dir,
            "echo \"$1 $2\" > \"temp-$1.txt\"\necho 'CHIP:DMG: status: 0x0'\n",
            Duration::from_secs(5),
        );
        exec.execute("13", true).await.unwrap();
        assert!(!dir.path().join("temp-13.txt").exists());
    }

    #[tokio::test]
    async fn arguments_passed_in_order() {
        let dir = TempDir::new().unwrap();
        let exec = script(&dir, "echo \"$1 $2\" > args.txt\n", Duration::from_secs(5));
        exec.execute("device-7", false).await.unwrap();
        let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
        assert_eq!(args.trim(), "device-7 0");
    }

    #[tokio::test]
    async fn non_success_status_is_error() {
        let dir = TempDir::new().unwrap();
        let exec = script(
            &dir,
            "touch \"temp-$1.txt\"\necho 'CHIP:IM: status: 0x32' >&2\n",
            Duration::from_secs(5),
        );
        let err = exec.execute("13", false).await.unwrap_err();
        assert!(matches!(err, EdgeError::Status(ref s) if s == "0x32"), "{err}");
        assert!(!dir.path().join("temp-13.txt").exists());
    }

    #[tokio::test]
    async fn non_zero_exit_is_error() {
        let dir = TempDir::new().unwrap();
        let exec = script(&dir, "exit 3\n", Duration::from_secs(5));
        let err = exec.execute("13", true).await.unwrap_err();
        assert!(matches!(err, EdgeError::Exit(3)));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let exec = CommandExecutor::new("/nonexistent/chip-tool", Duration::from_secs(1))
            .with_work_dir(dir.path());
        let err = exec.execute("13", true).await.unwrap_err();
        assert!(matches!(err, EdgeError::Spawn { .. }));
    }

    #[tokio::test]
    async fn hung_command_times_out_and_is_killed() {
        let dir = TempDir::new().unwrap();
        let exec = script(
            &dir,
            "touch \"temp-$1.txt\"\necho $$ > pid\nexec sleep 30\n",
            Duration::from_millis(500),
        );
        let started = std::time::Instant::now();
        let err = exec.execute("13", true).await.unwrap_err();
        assert!(matches!(err, EdgeError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!dir.path().join("temp-13.txt").exists());

        let pid = std::fs::read_to_string(dir.path().join("pid")).unwrap();
        let alive = std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.trim())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(!alive.success(), "command process still running");
    }

    #[tokio::test]
    async fn repeated_apply_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let exec = script(&dir, "echo \"$2\" > \"state-$1\"\necho 'status: 0x0'\n", Duration::from_secs(5));
        exec.execute("13", true).await.unwrap();
        exec.execute("13", true).await.unwrap();
        let state = std::fs::read_to_string(dir.path().join("state-13")).unwrap();
        assert_eq!(state.trim(), "1");
    }
}
