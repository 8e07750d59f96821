//! Subprocess runner with deadlines, rlimits and process-group termination.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::{ResourceLimits, SandboxConfig};
use crate::error::{Error, Result};
use crate::strategy::ExecutionPlan;
use crate::toolchain::ToolchainCommand;

use super::{CaptureBuffer, EnforcedLimits, ExecutionOutcome, SandboxEnv, ToolchainRunner};

const READ_CHUNK: usize = 8 * 1024;

/// Runner that spawns the toolchain as a local subprocess.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    env: SandboxEnv,
    kill_grace: Duration,
}

impl ProcessRunner {
    /// Creates a runner with an explicit environment and drain grace period.
    pub fn new(env: SandboxEnv, kill_grace: Duration) -> Self {
        Self { env, kill_grace }
    }

    /// Creates a runner from the sandbox configuration.
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(SandboxEnv::from_config(config), config.kill_grace())
    }

    /// Returns the environment handed to every process.
    pub fn env(&self) -> &SandboxEnv {
        &self.env
    }

    /// Runs `command` in `cwd` under `limits`.
    pub async fn run_command(
        &self,
        command: &ToolchainCommand,
        cwd: &Path,
        limits: &ResourceLimits,
    ) -> Result<ExecutionOutcome> {
        let ceilings = Ceilings::plan(limits);
        let enforced = ceilings.enforced(limits);

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(cwd)
            .env_clear()
            .envs(self.env.vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        ceilings.install(&mut cmd);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            Error::Internal(format!("failed to spawn {}: {}", command.program, e))
        })?;

        let pid = child.id();
        let group = ProcessGroup::new(pid);

        tracing::info!(
            program = %command.program,
            args = ?command.args,
            cwd = ?cwd,
            pid = ?pid,
            timeout_ms = enforced.timeout_ms,
            "spawned toolchain process"
        );

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("stdout was not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("stderr was not captured".to_string()))?;

        let mut out = Stream::new(limits.max_output_bytes);
        let mut err = Stream::new(limits.max_output_bytes);
        let mut timed_out = false;

        let deadline = tokio::time::sleep(limits.timeout);
        tokio::pin!(deadline);

        let status = loop {
            tokio::select! {
                read = stdout.read(&mut out.chunk), if out.open => out.absorb(read, "stdout"),
                read = stderr.read(&mut err.chunk), if err.open => err.absorb(read, "stderr"),
                exit = child.wait() => {
                    break exit.map_err(|e| Error::Internal(format!("failed to wait for {}: {}", command.program, e)))?;
                }
                () = &mut deadline => {
                    timed_out = true;
                    tracing::warn!(pid = ?pid, timeout_ms = enforced.timeout_ms, "deadline expired, killing process group");
                    group.kill();
                    #[cfg(not(unix))]
                    let _ = child.start_kill();
                    break child.wait().await.map_err(|e| Error::Internal(format!("failed to reap {}: {}", command.program, e)))?;
                }
            }
        };
        let duration = started.elapsed();

        // Anything still alive in the group is a straggler.
        group.kill();

        let drain = async {
            while out.open || err.open {
                tokio::select! {
                    read = stdout.read(&mut out.chunk), if out.open => out.absorb(read, "stdout"),
                    read = stderr.read(&mut err.chunk), if err.open => err.absorb(read, "stderr"),
                }
            }
        };
        if tokio::time::timeout(self.kill_grace, drain).await.is_err() {
            tracing::warn!(pid = ?pid, "output pipes still open after grace period");
        }
        group.release();

        let (stdout, stdout_truncated) = out.buffer.into_parts();
        let (stderr, stderr_truncated) = err.buffer.into_parts();
        let signal = exit_signal(&status);
        let resource_limit_exceeded =
            !timed_out && limit_violated(status.code(), signal, &stderr, &enforced);

        tracing::info!(
            pid = ?pid,
            exit_code = ?status.code(),
            signal = ?signal,
            timed_out,
            resource_limit_exceeded,
            duration_ms = duration.as_millis() as u64,
            "toolchain process finished"
        );

        Ok(ExecutionOutcome {
            exit_code: status.code(),
            signal,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            duration,
            timed_out,
            resource_limit_exceeded,
            enforced,
        })
    }
}

#[async_trait]
impl ToolchainRunner for ProcessRunner {
    async fn run(&self, plan: &ExecutionPlan, workspace: &Path) -> Result<ExecutionOutcome> {
        self.run_command(plan.command(), workspace, plan.limits())
            .await
    }

    fn name(&self) -> &str {
        "process"
    }
}

/// One captured pipe.
struct Stream {
    buffer: CaptureBuffer,
    chunk: [u8; READ_CHUNK],
    open: bool,
}

impl Stream {
    fn new(limit: usize) -> Self {
        Self {
            buffer: CaptureBuffer::new(limit),
            chunk: [0; READ_CHUNK],
            open: true,
        }
    }

    fn absorb(&mut self, read: std::io::Result<usize>, name: &str) {
        match read {
            Ok(0) => self.open = false,
            Ok(n) => self.buffer.push(&self.chunk[..n]),
            Err(e) => {
                tracing::error!(error = %e, stream = name, "error reading toolchain output");
                self.open = false;
            }
        }
    }
}

/// Kills the child's process group when dropped.
///
/// The child is started as the leader of a new group, so its pid is the group
/// id and one `killpg` reaches every descendant that did not leave the group.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    /// Returns true while some process we may signal is still in the group.
    ///
    /// Once the leader is reaped and the group empties, the id is free for
    /// reuse, so every kill checks this first.
    fn is_alive(&self) -> bool {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            return unsafe { libc::kill(-pgid, 0) } == 0;
        }
        false
    }

    fn kill(&self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            if !self.is_alive() {
                return;
            }
            // A live member keeps the id from being reused until it dies.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }

    fn release(mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Resource ceilings to install in the child before exec.
#[derive(Clone, Copy, Default)]
struct Ceilings {
    #[cfg(unix)]
    cpu: Option<libc::rlimit>,
    #[cfg(unix)]
    memory: Option<libc::rlimit>,
}

impl Ceilings {
    /// Decides which ceilings can be applied given the current hard limits.
    #[cfg(unix)]
    fn plan(limits: &ResourceLimits) -> Self {
        let cpu = limits.cpu_secs.and_then(|secs| {
            let secs = libc::rlim_t::try_from(secs).ok()?;
            let current = read_limit(|r| unsafe { libc::getrlimit(libc::RLIMIT_CPU, r) })?;
            // Soft below hard so SIGXCPU arrives before SIGKILL.
            fit(secs, secs.saturating_add(1), current)
        });

        let memory = limits.memory_bytes.and_then(|bytes| {
            let bytes = libc::rlim_t::try_from(bytes).ok()?;
            let current = read_limit(|r| unsafe { libc::getrlimit(libc::RLIMIT_AS, r) })?;
            fit(bytes, bytes, current)
        });

        Self { cpu, memory }
    }

    #[cfg(not(unix))]
    fn plan(_limits: &ResourceLimits) -> Self {
        Self::default()
    }

    fn enforced(&self, limits: &ResourceLimits) -> EnforcedLimits {
        #[cfg(unix)]
        let (cpu_secs, memory_bytes) = (
            self.cpu.map(|r| r.rlim_cur as u64),
            self.memory.map(|r| r.rlim_cur as u64),
        );
        #[cfg(not(unix))]
        let (cpu_secs, memory_bytes) = (None, None);

        EnforcedLimits {
            timeout_ms: u64::try_from(limits.timeout.as_millis()).unwrap_or(u64::MAX),
            cpu_secs,
            memory_bytes,
            max_output_bytes: limits.max_output_bytes,
        }
    }

    #[cfg(unix)]
    fn install(self, cmd: &mut Command) {
        cmd.process_group(0);

        if self.cpu.is_none() && self.memory.is_none() {
            return;
        }

        // SAFETY: the closure only calls setrlimit, which is async-signal-safe,
        // on values computed before the fork.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(cpu) = self.cpu {
                    if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if let Some(memory) = self.memory {
                    if libc::setrlimit(libc::RLIMIT_AS, &memory) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn install(self, _cmd: &mut Command) {}
}

#[cfg(unix)]
fn read_limit(get: impl FnOnce(&mut libc::rlimit) -> libc::c_int) -> Option<libc::rlimit> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    (get(&mut current) == 0).then_some(current)
}

/// Returns the ceiling to set, or `None` if the hard limit forbids it.
#[cfg(unix)]
fn fit(soft: libc::rlim_t, hard: libc::rlim_t, current: libc::rlimit) -> Option<libc::rlimit> {
    if current.rlim_max == libc::RLIM_INFINITY {
        return Some(libc::rlimit {
            rlim_cur: soft,
            rlim_max: hard,
        });
    }
    if soft > current.rlim_max {
        tracing::warn!(
            requested = soft as u64,
            hard = current.rlim_max as u64,
            "hard limit below requested ceiling, not applying"
        );
        return None;
    }
    Some(libc::rlimit {
        rlim_cur: soft,
        rlim_max: hard.min(current.rlim_max),
    })
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;

    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Markers the Go runtime and toolchain print when a ceiling is hit.
const MEMORY_MARKERS: &[&str] = &["out of memory", "cannot allocate memory"];
const CPU_MARKERS: &[&str] = &["cpu time limit exceeded"];

/// Decides whether a finished process died of an enforced ceiling.
///
/// SIGXCPU is unambiguous. A stderr marker only counts when the process
/// failed, since programs are free to print those words and exit cleanly.
fn limit_violated(
    exit_code: Option<i32>,
    signal: Option<i32>,
    stderr: &[u8],
    enforced: &EnforcedLimits,
) -> bool {
    #[cfg(unix)]
    if signal == Some(libc::SIGXCPU) {
        return true;
    }
    #[cfg(not(unix))]
    let _ = signal;

    if exit_code == Some(0) {
        return false;
    }

    let text = String::from_utf8_lossy(stderr).to_lowercase();
    (enforced.memory_bytes.is_some() && MEMORY_MARKERS.iter().any(|m| text.contains(m)))
        || (enforced.cpu_secs.is_some() && CPU_MARKERS.iter().any(|m| text.contains(m)))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(
            SandboxEnv::from_config(&SandboxConfig::default()),
            Duration::from_millis(500),
        )
    }

    fn limits(timeout_secs: u64) -> ResourceLimits {
        SandboxConfig::default().limits_for(Some(timeout_secs))
    }

    fn sh(script: &str) -> ToolchainCommand {
        ToolchainCommand::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[cfg(target_os = "linux")]
    fn is_gone(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => true,
            // Field 3, after the parenthesised command name.
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .map_or(true, |state| state == "Z" || state == "X"),
        }
    }

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let dir = TempDir::new().unwrap();
        let outcome = runner()
            .run_command(&sh("echo out; echo err >&2; exit 3"), dir.path(), &limits(10))
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.signal, None);
        assert_eq!(outcome.stdout, b"out\n");
        assert_eq!(outcome.stderr, b"err\n");
        assert!(!outcome.timed_out);
        assert!(!outcome.resource_limit_exceeded);
    }

    #[tokio::test]
    async fn runs_in_workspace_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();

        let outcome = runner()
            .run_command(&sh("cat marker.txt"), dir.path(), &limits(10))
            .await
            .unwrap();

        assert_eq!(outcome.stdout, b"here");
    }

    #[tokio::test]
    async fn missing_binary_is_internal_failure() {
        let dir = TempDir::new().unwrap();
        let command = ToolchainCommand::new("definitely-not-a-go-binary", vec![]);

        let err = runner()
            .run_command(&command, dir.path(), &limits(10))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn deadline_kills_and_reports_timeout() {
        let dir = TempDir::new().unwrap();
        let started = Instant::now();

        let outcome = runner()
            .run_command(
                &ToolchainCommand::new("sleep", vec!["30".to_string()]),
                dir.path(),
                &limits(1),
            )
            .await
            .unwrap();

        assert!(outcome.timed_out);
        assert!(!outcome.resource_limit_exceeded);
        assert_eq!(outcome.exit_code, None);
        assert_eq!(outcome.signal, Some(libc::SIGKILL));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn deadline_kills_whole_process_tree() {
        let dir = TempDir::new().unwrap();

        let outcome = runner()
            .run_command(&sh("sleep 30 & echo $!; wait"), dir.path(), &limits(1))
            .await
            .unwrap();
        assert!(outcome.timed_out);

        let grandchild: u32 = String::from_utf8_lossy(&outcome.stdout)
            .trim()
            .parse()
            .unwrap();

        let mut gone = false;
        for _ in 0..20 {
            if is_gone(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "background process {} survived", grandchild);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn stragglers_are_killed_after_exit() {
        let dir = TempDir::new().unwrap();

        let outcome = runner()
            .run_command(
                &sh("sleep 30 >/dev/null 2>&1 & echo $!"),
                dir.path(),
                &limits(10),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.timed_out);

        let straggler: u32 = String::from_utf8_lossy(&outcome.stdout)
            .trim()
            .parse()
            .unwrap();

        let mut gone = false;
        for _ in 0..20 {
            if is_gone(straggler) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "straggler {} survived", straggler);
    }

    #[tokio::test]
    async fn output_is_truncated_per_stream() {
        let dir = TempDir::new().unwrap();
        let mut limits = limits(10);
        limits.max_output_bytes = 1024;

        let outcome = runner()
            .run_command(
                &sh("i=0; while [ $i -lt 2000 ]; do echo 0123456789; i=$((i+1)); done; echo small >&2"),
                dir.path(),
                &limits,
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.len(), 1024);
        assert!(outcome.stdout_truncated);
        assert_eq!(outcome.stderr, b"small\n");
        assert!(!outcome.stderr_truncated);
    }

    #[tokio::test]
    async fn environment_is_scrubbed() {
        let dir = TempDir::new().unwrap();
        let mut config = SandboxConfig::default();
        config
            .extra_env
            .insert("SANDBOX_MARKER".to_string(), "1".to_string());
        let runner = ProcessRunner::new(SandboxEnv::from_config(&config), Duration::from_millis(500));

        let outcome = runner
            .run_command(
                &ToolchainCommand::new("env", vec![]),
                dir.path(),
                &limits(10),
            )
            .await
            .unwrap();

        let allowed: HashSet<&str> = runner.env().vars().map(|(k, _)| k).collect();
        let output = String::from_utf8_lossy(&outcome.stdout);
        for line in output.lines() {
            let key = line.split('=').next().unwrap_or_default();
            assert!(allowed.contains(key), "unexpected variable {}", key);
        }
        assert!(output.contains("GOTOOLCHAIN=local"));
        assert!(output.contains("SANDBOX_MARKER=1"));
    }

    #[tokio::test]
    async fn cpu_ceiling_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut limits = limits(10);
        limits.cpu_secs = Some(1);

        let outcome = runner()
            .run_command(&sh("while :; do :; done"), dir.path(), &limits)
            .await
            .unwrap();

        if outcome.enforced.cpu_secs.is_some() {
            assert!(outcome.resource_limit_exceeded);
            assert!(!outcome.timed_out);
        }
    }

    #[test]
    fn limit_detection_needs_applied_ceiling() {
        let none = EnforcedLimits::default();
        let memory = EnforcedLimits {
            memory_bytes: Some(1 << 20),
            ..Default::default()
        };

        assert!(limit_violated(None, Some(libc::SIGXCPU), b"", &none));
        assert!(!limit_violated(None, Some(libc::SIGKILL), b"", &none));
        assert!(!limit_violated(Some(2), None, b"fatal error: out of memory", &none));
        assert!(limit_violated(Some(2), None, b"fatal error: Out Of Memory", &memory));
        assert!(limit_violated(None, None, b"fatal error: Out Of Memory", &memory));
    }

    #[test]
    fn clean_exit_is_never_a_limit_violation() {
        let all = EnforcedLimits {
            memory_bytes: Some(1 << 20),
            cpu_secs: Some(1),
            ..Default::default()
        };

        assert!(!limit_violated(Some(0), None, b"cache: out of memory, evicting", &all));
        assert!(!limit_violated(None, Some(libc::SIGKILL), b"", &all));
        assert!(limit_violated(Some(1), None, b"signal: CPU time limit exceeded", &all));
    }

    #[tokio::test]
    async fn marker_text_on_clean_exit_is_success() {
        let dir = TempDir::new().unwrap();
        let mut limits = limits(10);
        limits.memory_bytes = Some(1 << 30);

        let outcome = runner()
            .run_command(
                &sh("echo 'cache: out of memory, evicting' >&2; exit 0"),
                dir.path(),
                &limits,
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.resource_limit_exceeded);
    }

    #[tokio::test]
    async fn external_sigkill_is_not_a_limit_violation() {
        let dir = TempDir::new().unwrap();
        let mut limits = limits(10);
        limits.cpu_secs = Some(30);

        let outcome = runner()
            .run_command(&sh("kill -9 $$"), dir.path(), &limits)
            .await
            .unwrap();

        assert_eq!(outcome.signal, Some(libc::SIGKILL));
        assert!(!outcome.timed_out);
        assert!(!outcome.resource_limit_exceeded);
    }

    #[test]
    fn reaped_group_is_not_signalled() {
        use std::os::unix::process::CommandExt;

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let group = ProcessGroup::new(Some(child.id()));
        assert!(group.is_alive());

        group.kill();
        child.wait().unwrap();

        assert!(!group.is_alive());
        group.release();
    }
}
