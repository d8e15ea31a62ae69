// src/runtime/process.rs
//
// Bounded child-process execution.
//
// - wall-clock timeout, SIGTERM to the process group, SIGKILL after a grace window
// - stdout/stderr captured incrementally with a live cap, tail-biased truncation
// - environment restricted to the sandbox allowlist

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::runtime::sandbox::sandbox_env;

pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_TIMEOUT_MS: u64 = 300_000;
/// Time between the graceful and the forceful signal.
pub const KILL_GRACE_MS: u64 = 1_000;
pub const MAX_OUTPUT_CHARS: usize = 10_000;

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Entries merged over the allowlisted parent environment.
    pub env: HashMap<String, String>,
    /// Written to the child's stdin, then stdin is closed.
    pub stdin: Option<String>,
    pub timeout_ms: u64,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            stdin: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// `sh -c <command>`
    pub fn shell(command: &str) -> Self {
        Self::new("sh").arg("-c").arg(command)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutput {
    /// `-1` when the process produced no real exit code.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawn_error: Option<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.spawn_error.is_none() && !self.timed_out && self.exit_code == 0
    }

    fn spawn_failed(message: String, started: Instant) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: message.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            timed_out: false,
            spawn_error: Some(message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    max_timeout_ms: u64,
    max_output_chars: usize,
    // merged under each spec's own env
    base_env: HashMap<String, String>,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TIMEOUT_MS, MAX_OUTPUT_CHARS)
    }
}

impl ProcessRunner {
    pub fn new(max_timeout_ms: u64, max_output_chars: usize) -> Self {
        Self {
            max_timeout_ms: max_timeout_ms.max(MIN_TIMEOUT_MS),
            max_output_chars,
            base_env: HashMap::new(),
        }
    }

    /// Environment entries granted to every child this runner starts.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.base_env = env;
        self
    }

    pub fn max_output_chars(&self) -> usize {
        self.max_output_chars
    }

    fn child_env(&self, spec_env: &HashMap<String, String>) -> HashMap<String, String> {
        let mut env = self.base_env.clone();
        env.extend(spec_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    pub fn clamp_timeout(&self, timeout_ms: u64) -> u64 {
        timeout_ms.clamp(MIN_TIMEOUT_MS, self.max_timeout_ms)
    }

    pub async fn run(&self, spec: ProcessSpec) -> ProcessOutput {
        let started = Instant::now();
        let timeout_ms = self.clamp_timeout(spec.timeout_ms);

        let mut std_cmd = std::process::Command::new(&spec.program);
        // own process group, so a timeout reaches grandchildren too
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut cmd = Command::from(std_cmd);
        cmd.args(&spec.args)
            .env_clear()
            .envs(sandbox_env(&self.child_env(&spec.env)))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn '{}': {}", spec.program, e);
                return ProcessOutput::spawn_failed(
                    format!("Failed to spawn '{}': {}", spec.program, e),
                    started,
                );
            }
        };
        let pid = child.id();
        debug!("Spawned '{}' (pid {:?}, timeout {} ms)", spec.program, pid, timeout_ms);

        let live_cap = self.max_output_chars.saturating_mul(2);
        let stdout_buf = Arc::new(Mutex::new(CappedBuffer::new(live_cap)));
        let stderr_buf = Arc::new(Mutex::new(CappedBuffer::new(live_cap)));

        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_capture(out, stdout_buf.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_capture(err, stderr_buf.clone()));
        }

        if let (Some(input), Some(mut stdin)) = (spec.stdin, child.stdin.take()) {
            tokio::spawn(async move {
                // a child that never reads its stdin is not an error
                let _ = stdin.write_all(input.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let waited = tokio::select! {
            res = child.wait() => Some(res),
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => None,
        };

        let (status, timed_out) = match waited {
            Some(Ok(status)) => (Some(status), false),
            Some(Err(e)) => {
                warn!("Failed to wait for '{}': {}", spec.program, e);
                (None, false)
            }
            None => {
                warn!("⏱️ '{}' timed out after {} ms, terminating", spec.program, timeout_ms);
                (terminate(&mut child, pid).await, true)
            }
        };

        // pipes may outlive the child if it leaked them to a detached process
        for mut handle in readers {
            if tokio::time::timeout(Duration::from_millis(KILL_GRACE_MS), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);
        let stdout = stdout_buf.lock().finish(self.max_output_chars);
        let stderr = stderr_buf.lock().finish(self.max_output_chars);

        ProcessOutput {
            exit_code,
            stdout,
            stderr,
            duration_ms: started.elapsed().as_millis() as u64,
            timed_out,
            spawn_error: None,
        }
    }
}

/// Graceful then forceful termination, bounded by `KILL_GRACE_MS`.
async fn terminate(child: &mut Child, pid: Option<u32>) -> Option<ExitStatus> {
    signal_group(pid, Signal::Terminate);
    if !cfg!(unix) {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(Duration::from_millis(KILL_GRACE_MS), child.wait()).await {
        Ok(res) => res.ok(),
        Err(_) => {
            debug!("Process {:?} ignored SIGTERM, sending SIGKILL", pid);
            signal_group(pid, Signal::Kill);
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}

enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // negative pid: the whole group created by process_group(0)
    unsafe {
        libc::kill(-(pid as libc::pid_t), sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

fn spawn_capture<R>(mut reader: R, buf: Arc<Mutex<CappedBuffer>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.lock().push_bytes(&chunk[..n]),
            }
        }
    })
}

// ============================================================================
// 输出截断 (Output capture)
// ============================================================================

/// Keeps at most `cap` characters, discarding from the front.
#[derive(Debug)]
struct CappedBuffer {
    text: String,
    chars: usize,
    dropped: usize,
    cap: usize,
    /// Bytes of a UTF-8 sequence split across reads.
    pending: Vec<u8>,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            dropped: 0,
            cap,
            pending: Vec::new(),
        }
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        let decoded = match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let s = s.to_string();
                self.pending.clear();
                s
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let s = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                s
            }
            Err(_) => {
                let s = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                s
            }
        };
        self.push_str(&decoded);
    }

    fn push_str(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        self.text.push_str(s);
        self.chars += s.chars().count();
        if self.chars > self.cap {
            let excess = self.chars - self.cap;
            let cut = byte_offset_of_char(&self.text, excess);
            self.text.drain(..cut);
            self.chars -= excess;
            self.dropped += excess;
        }
    }

    fn finish(&mut self, max_chars: usize) -> String {
        if !self.pending.is_empty() {
            let rest = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.push_str(&rest);
        }
        tail_with_marker(&self.text, self.chars, self.dropped, max_chars)
    }
}

fn byte_offset_of_char(text: &str, n: usize) -> usize {
    text.char_indices().nth(n).map(|(i, _)| i).unwrap_or(text.len())
}

pub fn truncation_marker(omitted: usize) -> String {
    format!("[...truncated {} chars...]\n", omitted)
}

fn tail_with_marker(text: &str, char_len: usize, already_dropped: usize, max_chars: usize) -> String {
    let excess = char_len.saturating_sub(max_chars);
    let omitted = already_dropped + excess;
    if omitted == 0 {
        return text.to_string();
    }
    let start = byte_offset_of_char(text, excess);
    format!("{}{}", truncation_marker(omitted), &text[start..])
}

/// Keeps the last `max_chars` characters of `text`, prefixed with a marker
/// when anything was cut.
pub fn truncate_tail(text: &str, max_chars: usize) -> String {
    tail_with_marker(text, text.chars().count(), 0, max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_tail_keeps_end() {
        assert_eq!(truncate_tail("short", 10), "short");
        let out = truncate_tail("0123456789abcdef", 6);
        assert_eq!(out, format!("{}abcdef", truncation_marker(10)));
    }

    #[test]
    fn test_capped_buffer_handles_split_utf8() {
        let mut buf = CappedBuffer::new(100);
        let bytes = "héllo".as_bytes();
        // split inside the two-byte 'é'
        buf.push_bytes(&bytes[..2]);
        buf.push_bytes(&bytes[2..]);
        assert_eq!(buf.finish(100), "héllo");
    }

    #[test]
    fn test_capped_buffer_counts_live_drops() {
        let mut buf = CappedBuffer::new(4);
        buf.push_str("abcdef");
        buf.push_str("gh");
        assert_eq!(buf.text, "efgh");
        assert_eq!(buf.dropped, 4);
        assert_eq!(buf.finish(2), format!("{}gh", truncation_marker(6)));
    }

    #[tokio::test]
    async fn test_exit_codes() {
        let runner = ProcessRunner::default();
        let ok = runner.run(ProcessSpec::shell("exit 0")).await;
        assert!(ok.success());
        assert_eq!(ok.exit_code, 0);
        assert!(!ok.timed_out);

        let failed = runner.run(ProcessSpec::shell("echo boom >&2; exit 7")).await;
        assert!(!failed.success());
        assert_eq!(failed.exit_code, 7);
        assert_eq!(failed.stderr.trim(), "boom");
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let runner = ProcessRunner::default();
        let out = runner
            .run(ProcessSpec::new("cat").stdin(r#"{"text": "hi"}"#))
            .await;
        assert!(out.success());
        assert_eq!(out.stdout, r#"{"text": "hi"}"#);
    }

    #[tokio::test]
    async fn test_spawn_error_reports_minus_one() {
        let runner = ProcessRunner::default();
        let out = runner
            .run(ProcessSpec::new("/definitely/not/a/real/binary"))
            .await;
        assert!(!out.success());
        assert_eq!(out.exit_code, -1);
        assert!(out.spawn_error.is_some());
    }

    #[tokio::test]
    async fn test_stdout_truncated_to_tail() {
        let runner = ProcessRunner::new(DEFAULT_MAX_TIMEOUT_MS, 100);
        let out = runner
            .run(ProcessSpec::shell(
                "head -c 500 /dev/zero | tr '\\0' a; printf END",
            ))
            .await;
        assert!(out.success());
        let expected_tail = format!("{}END", "a".repeat(97));
        assert_eq!(out.stdout, format!("{}{}", truncation_marker(403), expected_tail));
        assert_eq!(
            out.stdout.chars().count(),
            truncation_marker(403).chars().count() + 100
        );
    }

    #[tokio::test]
    async fn test_parent_secret_not_visible() {
        std::env::set_var("PROMPTWEAVE_TEST_SECRET", "s3cret");
        let runner = ProcessRunner::default();
        let out = runner
            .run(ProcessSpec::shell(
                r#"printf '%s' "${PROMPTWEAVE_TEST_SECRET:-absent}""#,
            ))
            .await;
        assert_eq!(out.stdout, "absent");

        let mut env = HashMap::new();
        env.insert("PROMPTWEAVE_GRANTED".to_string(), "yes".to_string());
        let granted = runner
            .run(ProcessSpec::shell(r#"printf '%s' "$PROMPTWEAVE_GRANTED""#).env(env))
            .await;
        assert_eq!(granted.stdout, "yes");
    }

    #[tokio::test]
    async fn test_runner_env_is_overridden_by_spec() {
        let mut base = HashMap::new();
        base.insert("PW_MODE".to_string(), "base".to_string());
        base.insert("PW_KEEP".to_string(), "kept".to_string());
        let runner = ProcessRunner::default().with_env(base);

        let mut own = HashMap::new();
        own.insert("PW_MODE".to_string(), "spec".to_string());
        let out = runner
            .run(ProcessSpec::shell(r#"printf '%s/%s' "$PW_MODE" "$PW_KEEP""#).env(own))
            .await;
        assert_eq!(out.stdout, "spec/kept");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let runner = ProcessRunner::default();
        let out = runner
            .run(ProcessSpec::shell("echo $$; sleep 30").timeout_ms(1_000))
            .await;
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.duration_ms < 1_000 + KILL_GRACE_MS + 2_000);

        #[cfg(unix)]
        {
            let pid: i32 = out.stdout.trim().parse().unwrap();
            let alive = unsafe { libc::kill(pid, 0) } == 0;
            assert!(!alive, "child {} still running after grace window", pid);
        }
    }

    // a killed grandchild is reparented; until it is reaped it lingers as a zombie
    #[cfg(unix)]
    async fn wait_until_gone(pid: i32) -> bool {
        for _ in 0..30 {
            let zombie = std::fs::read_to_string(format!("/proc/{}/stat", pid))
                .map(|stat| stat.rsplit(')').next().map(|rest| rest.trim_start().starts_with('Z')).unwrap_or(false))
                .unwrap_or(false);
            if zombie || unsafe { libc::kill(pid, 0) } != 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_ignoring_group_is_killed() {
        let runner = ProcessRunner::default();
        let out = runner
            .run(ProcessSpec::shell("trap '' TERM; sleep 30 & echo $!; wait").timeout_ms(1_000))
            .await;
        assert!(out.timed_out);
        assert_eq!(out.exit_code, -1);
        assert!(out.duration_ms >= 1_000 + KILL_GRACE_MS);
        assert!(out.duration_ms < 1_000 + KILL_GRACE_MS + 2_000);

        let grandchild: i32 = out.stdout.trim().parse().unwrap();
        assert!(wait_until_gone(grandchild).await, "grandchild {} survived", grandchild);
    }

    #[test]
    fn test_timeout_is_clamped() {
        let runner = ProcessRunner::new(5_000, MAX_OUTPUT_CHARS);
        assert_eq!(runner.clamp_timeout(10), MIN_TIMEOUT_MS);
        assert_eq!(runner.clamp_timeout(2_500), 2_500);
        assert_eq!(runner.clamp_timeout(60_000), 5_000);
    }
}
