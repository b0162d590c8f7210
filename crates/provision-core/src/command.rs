//! Shell command execution with retry, exponential backoff and a hard timeout.
//!
//! Every attempt runs `sh -c <command>` in its own process group so a timeout
//! or interrupt can kill the whole tree. Attempts are recorded in an audit
//! trail that ends up in the run report.

use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often a blocked wait wakes up to check the deadline and interrupt flag.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Captured output is capped to this many bytes (the tail is kept).
const MAX_OUTPUT: usize = 10 * 1024;

// ---------------------------------------------------------------------------
// CommandSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandSpec {
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Retry schedule: `attempts` total tries, sleeping `base_delay * 2^(n-1)`
/// (capped at `max_delay`) after the n-th failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
            max_delay: Duration::from_secs(300),
        }
    }

    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Total tries. Zero is treated as one.
    pub fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Delay to wait after the `attempt`-th failure (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// The full sleep schedule between attempts.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts()).map(|n| self.delay_after(n)).collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

// ---------------------------------------------------------------------------
// CommandResult / AuditEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    /// Exit code of the last attempt. `-1` when the process could not be
    /// spawned, timed out, or was interrupted; `128 + n` when killed by signal `n`.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub attempts: u32,
    pub timed_out: bool,
    #[serde(default)]
    pub interrupted: bool,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.interrupted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub command: String,
    /// 1-indexed attempt number.
    pub attempt: u32,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct CommandRunner {
    audit: Vec<AuditEntry>,
    interrupt: Option<Arc<AtomicBool>>,
}

struct Attempt {
    exit_code: i32,
    stdout: String,
    stderr: String,
    timed_out: bool,
    interrupted: bool,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort waits and skip further attempts once `flag` is set.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn take_audit(&mut self) -> Vec<AuditEntry> {
        std::mem::take(&mut self.audit)
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Run `spec` until it exits zero or the policy's attempts run out.
    ///
    /// A non-zero exit after the last attempt is returned as a result, never
    /// as an error; the caller decides whether it is fatal. `None` timeout
    /// means wait indefinitely.
    pub fn execute(
        &mut self,
        spec: &CommandSpec,
        timeout: Option<Duration>,
        policy: &RetryPolicy,
    ) -> CommandResult {
        let started = Instant::now();
        let max_attempts = policy.max_attempts();
        let mut attempt_no = 0;
        let mut last = Attempt {
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            interrupted: false,
        };

        while attempt_no < max_attempts {
            if attempt_no > 0 {
                let delay = policy.delay_after(attempt_no);
                tracing::debug!(command = %spec.command, delay_ms = delay.as_millis() as u64, "backing off before retry");
                if !self.pause(delay) {
                    last.interrupted = true;
                    break;
                }
            }
            attempt_no += 1;

            let at = Utc::now();
            let attempt_start = Instant::now();
            last = self.run_once(spec, timeout);
            let duration_ms = attempt_start.elapsed().as_millis() as u64;

            self.audit.push(AuditEntry {
                command: spec.command.clone(),
                attempt: attempt_no,
                exit_code: last.exit_code,
                timed_out: last.timed_out,
                duration_ms,
                started_at: at,
            });

            if last.exit_code == 0 && !last.timed_out && !last.interrupted {
                tracing::info!(command = %spec.command, attempt = attempt_no, duration_ms, "command succeeded");
                break;
            }
            tracing::warn!(
                command = %spec.command,
                attempt = attempt_no,
                max_attempts,
                exit_code = last.exit_code,
                timed_out = last.timed_out,
                duration_ms,
                "command attempt failed"
            );
            if last.interrupted {
                break;
            }
        }

        CommandResult {
            command: spec.command.clone(),
            exit_code: last.exit_code,
            stdout: last.stdout,
            stderr: last.stderr,
            attempts: attempt_no,
            timed_out: last.timed_out,
            interrupted: last.interrupted,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Sleep for `d` in slices. Returns false if interrupted.
    fn pause(&self, d: Duration) -> bool {
        let until = Instant::now() + d;
        loop {
            if self.interrupted() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            std::thread::sleep((until - now).min(WAIT_SLICE));
        }
    }

    /// Single attempt. Readers drain stdout/stderr on dedicated threads to
    /// avoid pipe-buffer deadlocks. A waiter thread reports the exit status;
    /// all three report over one channel so this thread can watch the
    /// deadline until the shell has exited and both pipes are closed.
    ///
    /// A background child that keeps the pipes open holds the attempt open
    /// too, and is killed with the group when the deadline passes.
    fn run_once(&self, spec: &CommandSpec, timeout: Option<Duration>) -> Attempt {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return Attempt {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("failed to spawn: {e}"),
                    timed_out: false,
                    interrupted: false,
                }
            }
        };

        let pgid = Pid::from_raw(child.id() as i32);
        let (tx, rx) = mpsc::channel();
        spawn_reader(child.stdout.take(), tx.clone(), Event::Stdout);
        spawn_reader(child.stderr.take(), tx.clone(), Event::Stderr);
        std::thread::spawn(move || {
            let _ = tx.send(Event::Exited(child.wait()));
        });

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut status: Option<std::io::Result<ExitStatus>> = None;
        let mut stdout: Option<String> = None;
        let mut stderr: Option<String> = None;

        while status.is_none() || stdout.is_none() || stderr.is_none() {
            match rx.recv_timeout(WAIT_SLICE) {
                Ok(Event::Exited(res)) => status = Some(res),
                Ok(Event::Stdout(out)) => stdout = Some(out),
                Ok(Event::Stderr(err)) => stderr = Some(err),
                Err(RecvTimeoutError::Timeout) => {
                    let interrupted = self.interrupted();
                    let expired = deadline.is_some_and(|d| Instant::now() >= d);
                    if !(interrupted || expired) {
                        continue;
                    }
                    kill_group(pgid);
                    if status.is_none() {
                        reap(&rx);
                    }
                    let stderr = if interrupted {
                        "interrupted".to_string()
                    } else {
                        let secs = timeout.map(|t| t.as_secs_f64()).unwrap_or_default();
                        format!("timed out after {secs:.1}s")
                    };
                    return Attempt {
                        exit_code: -1,
                        stdout: String::new(),
                        stderr,
                        timed_out: !interrupted,
                        interrupted,
                    };
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let stdout = stdout.unwrap_or_default();
        match status {
            Some(Ok(s)) => Attempt {
                exit_code: exit_code(s),
                stdout: cap_output(&stdout),
                stderr: cap_output(&stderr.unwrap_or_default()),
                timed_out: false,
                interrupted: false,
            },
            Some(Err(e)) => Attempt {
                exit_code: -1,
                stdout: cap_output(&stdout),
                stderr: format!("wait failed: {e}"),
                timed_out: false,
                interrupted: false,
            },
            None => Attempt {
                exit_code: -1,
                stdout: cap_output(&stdout),
                stderr: "waiter thread exited".to_string(),
                timed_out: false,
                interrupted: false,
            },
        }
    }
}

enum Event {
    Exited(std::io::Result<ExitStatus>),
    Stdout(String),
    Stderr(String),
}

fn spawn_reader<R: Read + Send + 'static>(
    source: Option<R>,
    tx: mpsc::Sender<Event>,
    wrap: fn(String) -> Event,
) {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut r) = source {
            let _ = r.read_to_end(&mut buf);
        }
        let _ = tx.send(wrap(String::from_utf8_lossy(&buf).into_owned()));
    });
}

/// Wait briefly for the killed shell's exit status so it is not left a
/// zombie. Reader results arriving meanwhile are discarded.
fn reap(rx: &mpsc::Receiver<Event>) {
    let until = Instant::now() + Duration::from_secs(5);
    while let Some(left) = until.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(Event::Exited(_)) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => -1,
    }
}

/// SIGKILL the whole process group. Best-effort.
fn kill_group(pgid: Pid) {
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        tracing::debug!(pgid = pgid.as_raw(), error = %e, "killpg failed");
    }
}

/// Trim and keep at most `MAX_OUTPUT` trailing bytes, on a char boundary.
fn cap_output(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.len() <= MAX_OUTPUT {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - MAX_OUTPUT;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(10))
    }

    #[test]
    fn success_runs_once() {
        let mut runner = CommandRunner::new();
        let result = runner.execute(&CommandSpec::shell("echo 'hello world'"), None, &quick(3));
        assert!(result.success());
        assert_eq!(result.attempts, 1);
        assert_eq!(result.stdout, "hello world");
        assert_eq!(runner.take_audit().len(), 1);
    }

    #[test]
    fn always_failing_makes_exactly_max_attempts() {
        let mut runner = CommandRunner::new();
        let started = Instant::now();
        let result = runner.execute(&CommandSpec::shell("false"), None, &quick(3));

        assert!(!result.success());
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.attempts, 3);
        let audit = runner.take_audit();
        assert_eq!(audit.len(), 3);
        assert_eq!(
            audit.iter().map(|a| a.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        // 10ms + 20ms of backoff at minimum
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn backoff_doubles_and_is_strictly_increasing() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        let schedule = policy.schedule();
        assert_eq!(
            schedule,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert!(schedule.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn backoff_respects_max_delay() {
        let policy =
            RetryPolicy::new(5, Duration::from_secs(1)).with_max_delay(Duration::from_secs(3));
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(3));
        assert_eq!(policy.delay_after(4), Duration::from_secs(3));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let mut runner = CommandRunner::new();
        let result = runner.execute(&CommandSpec::shell("true"), None, &quick(0));
        assert!(result.success());
        assert_eq!(result.attempts, 1);
    }

    #[test]
    fn retries_then_passes() {
        // File-based counter: fails on attempt 1, passes on attempt 2+
        let dir = tempfile::TempDir::new().unwrap();
        let counter = dir.path().join("counter");
        std::fs::write(&counter, "0").unwrap();
        let cmd = format!(
            "c=$(cat {p}); c=$((c+1)); echo $c > {p}; [ $c -ge 2 ]",
            p = counter.display()
        );
        let mut runner = CommandRunner::new();
        let result = runner.execute(&CommandSpec::shell(cmd), None, &quick(3));
        assert!(result.success());
        assert_eq!(result.attempts, 2);
    }

    #[test]
    fn timeout_counts_as_failed_attempt() {
        let mut runner = CommandRunner::new();
        let started = Instant::now();
        let result = runner.execute(
            &CommandSpec::shell("sleep 60"),
            Some(Duration::from_millis(150)),
            &quick(2),
        );
        assert!(result.timed_out);
        assert!(!result.success());
        assert_eq!(result.attempts, 2);
        assert!(result.stderr.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn timeout_kills_process_group() {
        let dir = tempfile::TempDir::new().unwrap();
        let pidfile = dir.path().join("pid");
        let cmd = format!("sleep 60 & echo $! > {}; wait", pidfile.display());
        let mut runner = CommandRunner::new();
        let result = runner.execute(
            &CommandSpec::shell(cmd),
            Some(Duration::from_millis(300)),
            &RetryPolicy::once(),
        );
        assert!(result.timed_out);

        let pid = std::fs::read_to_string(&pidfile).unwrap();
        let stat = format!("/proc/{}/stat", pid.trim());
        let deadline = Instant::now() + Duration::from_secs(2);
        let gone = loop {
            // A zombie awaiting reaping counts as terminated.
            let alive = std::fs::read_to_string(&stat)
                .map(|s| !s.contains(") Z "))
                .unwrap_or(false);
            if !alive {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            std::thread::sleep(Duration::from_millis(20));
        };
        assert!(gone, "background sleep should be killed with the group");
    }

    #[test]
    fn timeout_covers_background_child_holding_output_open() {
        let mut runner = CommandRunner::new();
        let started = Instant::now();
        let result = runner.execute(
            &CommandSpec::shell("sleep 6 & exit 0"),
            Some(Duration::from_millis(500)),
            &RetryPolicy::once(),
        );
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(result.timed_out);
        assert!(!result.success());
    }

    #[test]
    fn interrupt_reaches_background_child_holding_output_open() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = flag.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            setter.store(true, Ordering::SeqCst);
        });
        let mut runner = CommandRunner::new().with_interrupt(flag);
        let started = Instant::now();
        let result = runner.execute(&CommandSpec::shell("sleep 6 & exit 0"), None, &RetryPolicy::once());
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(result.interrupted);
        assert_eq!(result.stderr, "interrupted");
    }

    #[test]
    fn detached_background_child_does_not_hold_the_attempt() {
        let mut runner = CommandRunner::new();
        let started = Instant::now();
        let result = runner.execute(
            &CommandSpec::shell("sleep 6 >/dev/null 2>&1 & echo started"),
            Some(Duration::from_secs(3)),
            &RetryPolicy::once(),
        );
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(result.success());
        assert_eq!(result.stdout, "started");
    }

    #[test]
    fn cwd_and_env_are_applied() {
        let dir = tempfile::TempDir::new().unwrap();
        let spec = CommandSpec::shell("printf '%s:%s' \"$GREETING\" \"$(basename \"$(/bin/pwd)\")\"")
            .with_cwd(dir.path())
            .with_env("GREETING", "hi");
        let mut runner = CommandRunner::new();
        let result = runner.execute(&spec, None, &RetryPolicy::once());
        let base = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(result.stdout, format!("hi:{base}"));
    }

    #[test]
    fn stderr_is_captured() {
        let mut runner = CommandRunner::new();
        let result = runner.execute(
            &CommandSpec::shell("echo 'error msg' >&2; exit 7"),
            None,
            &RetryPolicy::once(),
        );
        assert_eq!(result.exit_code, 7);
        assert_eq!(result.stderr, "error msg");
    }

    #[test]
    fn interrupt_stops_retries() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut runner = CommandRunner::new().with_interrupt(flag);
        let started = Instant::now();
        let result = runner.execute(
            &CommandSpec::shell("sleep 30"),
            None,
            &RetryPolicy::new(5, Duration::from_secs(10)),
        );
        assert!(result.interrupted);
        assert_eq!(result.attempts, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn take_audit_drains() {
        let mut runner = CommandRunner::new();
        runner.execute(&CommandSpec::shell("true"), None, &RetryPolicy::once());
        assert_eq!(runner.take_audit().len(), 1);
        assert!(runner.take_audit().is_empty());
    }

    #[test]
    fn cap_output_keeps_tail() {
        let long = "x".repeat(MAX_OUTPUT) + "tail";
        let capped = cap_output(&long);
        assert_eq!(capped.len(), MAX_OUTPUT);
        assert!(capped.ends_with("tail"));
    }
}
