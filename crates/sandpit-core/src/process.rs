//! Deadline-bound child processes with bounded output capture.
//!
//! The child gets a cleared environment plus exactly the variables passed in,
//! runs inside its scratch directory, and is killed when the deadline passes or
//! the cancellation token fires. Stdout and stderr are read concurrently so a
//! chatty child never blocks on a full pipe; anything past the limit is drained
//! and dropped.
//!
//! On unix the child leads its own process group, and the whole group is
//! killed when the run ends, so nothing a compiler forks outlives its build.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub deadline: Instant,
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub duration: Duration,
}

#[derive(Debug)]
pub enum ProcessOutcome {
    Exited(CapturedOutput),
    TimedOut,
    Cancelled,
}

/// Runs `spec` to completion, deadline or cancellation.
///
/// Only a failure to start the process is returned as `Err`.
pub async fn run_process(
    spec: &ProcessSpec,
    cancel: &CancellationToken,
) -> std::io::Result<ProcessOutcome> {
    let started = Instant::now();

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .env_clear()
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;
    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let limit = spec.max_output_bytes;

    let collect = async {
        let (out, err, status) = tokio::join!(
            read_bounded(stdout, limit),
            read_bounded(stderr, limit),
            child.wait()
        );
        (out, err, status)
    };

    // `None` means cancelled, `Some(None)` means the deadline passed.
    let waited = tokio::select! {
        res = tokio::time::timeout_at(spec.deadline, collect) => Some(res.ok()),
        _ = cancel.cancelled() => None,
    };

    let Some(finished) = waited else {
        terminate(&mut child, pid).await;
        return Ok(ProcessOutcome::Cancelled);
    };

    let Some((out, err, status)) = finished else {
        log::warn!(
            "Process {} exceeded its deadline in {}, killing",
            spec.program,
            spec.cwd.display()
        );
        terminate(&mut child, pid).await;
        return Ok(ProcessOutcome::TimedOut);
    };
    // Background jobs the child left behind.
    kill_process_group(pid);

    let status = status?;
    let (stdout, stdout_truncated) = out?;
    let (stderr, stderr_truncated) = err?;

    Ok(ProcessOutcome::Exited(CapturedOutput {
        exit_status: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        truncated: stdout_truncated || stderr_truncated,
        duration: started.elapsed(),
    }))
}

async fn terminate(child: &mut tokio::process::Child, pid: Option<u32>) {
    kill_process_group(pid);
    if let Err(e) = child.kill().await {
        log::debug!("Failed to kill child process: {}", e);
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // SAFETY: a negative pid addresses the process group led by our child,
    // created with `process_group(0)` at spawn. kill(2) touches no memory.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log::debug!("Failed to kill process group {}: {}", pgid, err);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

async fn read_bounded<R>(reader: Option<R>, limit: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok((Vec::new(), false));
    };

    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..n.min(room)]);
        if n > room {
            truncated = true;
        }
    }
    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    fn sh(script: &str, cwd: PathBuf, timeout: Duration) -> ProcessSpec {
        ProcessSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![("PATH".to_string(), "/usr/bin:/bin".to_string())],
            cwd,
            deadline: Instant::now() + timeout,
            max_output_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn test_captures_exit_status_and_streams() {
        let dir = tempdir().unwrap();
        let spec = sh(
            "echo out; echo err >&2; exit 3",
            dir.path().to_path_buf(),
            Duration::from_secs(10),
        );

        match run_process(&spec, &CancellationToken::new()).await.unwrap() {
            ProcessOutcome::Exited(output) => {
                assert_eq!(output.exit_status, 3);
                assert_eq!(output.stdout, "out\n");
                assert_eq!(output.stderr, "err\n");
                assert!(!output.truncated);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_environment_is_scrubbed() {
        std::env::set_var("SANDPIT_PROCESS_LEAK", "secret");
        let dir = tempdir().unwrap();
        let spec = sh(
            "echo \"leak=${SANDPIT_PROCESS_LEAK:-none} path=$PATH\"",
            dir.path().to_path_buf(),
            Duration::from_secs(10),
        );

        let ProcessOutcome::Exited(output) =
            run_process(&spec, &CancellationToken::new()).await.unwrap()
        else {
            panic!("process did not exit");
        };
        assert_eq!(output.stdout, "leak=none path=/usr/bin:/bin\n");
        std::env::remove_var("SANDPIT_PROCESS_LEAK");
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempdir().unwrap();
        let spec = sh("echo hi > marker", dir.path().to_path_buf(), Duration::from_secs(10));
        run_process(&spec, &CancellationToken::new()).await.unwrap();
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_output_is_truncated_at_limit() {
        let dir = tempdir().unwrap();
        let spec = sh(
            "i=0; while [ $i -lt 500 ]; do echo 0123456789; i=$((i+1)); done",
            dir.path().to_path_buf(),
            Duration::from_secs(10),
        );

        let ProcessOutcome::Exited(output) =
            run_process(&spec, &CancellationToken::new()).await.unwrap()
        else {
            panic!("process did not exit");
        };
        assert_eq!(output.exit_status, 0);
        assert_eq!(output.stdout.len(), 1024);
        assert!(output.truncated);
    }

    #[tokio::test]
    async fn test_deadline_kills_process() {
        let dir = tempdir().unwrap();
        let spec = sh("sleep 5", dir.path().to_path_buf(), Duration::from_millis(200));

        let started = std::time::Instant::now();
        let outcome = run_process(&spec, &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_deadline_kills_grandchildren() {
        let dir = tempdir().unwrap();
        let spec = sh(
            "sh -c 'sleep 1; touch marker'; true",
            dir.path().to_path_buf(),
            Duration::from_millis(200),
        );

        let outcome = run_process(&spec, &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::TimedOut));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_background_jobs_do_not_outlive_exit() {
        let dir = tempdir().unwrap();
        let spec = sh(
            "(sleep 1; touch late) >/dev/null 2>&1 & echo started",
            dir.path().to_path_buf(),
            Duration::from_secs(10),
        );

        let ProcessOutcome::Exited(output) =
            run_process(&spec, &CancellationToken::new()).await.unwrap()
        else {
            panic!("process did not exit");
        };
        assert_eq!(output.stdout, "started\n");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late").exists());
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let dir = tempdir().unwrap();
        let spec = sh("sleep 5", dir.path().to_path_buf(), Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = run_process(&spec, &cancel).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempdir().unwrap();
        let mut spec = sh("true", dir.path().to_path_buf(), Duration::from_secs(5));
        spec.program = "/nonexistent/compiler".to_string();
        assert!(run_process(&spec, &CancellationToken::new()).await.is_err());
    }
}
