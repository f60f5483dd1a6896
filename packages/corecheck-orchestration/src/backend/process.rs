//! Child-process backend
//!
//! Each job is one invocation of the configured program, started as the
//! leader of its own process group. Job params arrive as JSON on stdin,
//! identifiers as `CORECHECK_*` environment variables. Exit status 0 means
//! success; stdout (JSON if it parses) becomes the output.
//!
//! The job id carries the process group (`job-<token>-pg<pgid>`), so any
//! process that reads it from the store can terminate the job, not only the
//! one that spawned it.

use std::process::Stdio;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ComputeBackend, JobOutcome, JobRequest};
use crate::error::{OrchestratorError, Result};

/// Bytes of stderr kept as failure diagnostics
const STDERR_TAIL: usize = 4096;

/// Environment variable carrying the job token into the child
const TOKEN_ENV: &str = "CORECHECK_JOB_TOKEN";

struct ProcessJob {
    outcome: watch::Receiver<Option<JobOutcome>>,
    kill: Option<oneshot::Sender<()>>,
}

pub struct ProcessBackend {
    program: String,
    args: Vec<String>,
    jobs: DashMap<String, ProcessJob>,
}

impl ProcessBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            jobs: DashMap::new(),
        }
    }

    /// Jobs started by this backend that are still tracked in memory
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Ask the local monitor to kill the job; `false` if it is not tracked here
    fn signal_local(&self, job_id: &str) -> bool {
        let Some((_, mut job)) = self.jobs.remove(job_id) else {
            return false;
        };
        if let Some(kill) = job.kill.take() {
            let _ = kill.send(());
        }
        true
    }
}

#[async_trait]
impl ComputeBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn submit(&self, request: JobRequest) -> Result<String> {
        let token = Uuid::new_v4().simple().to_string();
        let payload = serde_json::to_vec(&request.params).map_err(OrchestratorError::serialization)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("CORECHECK_EXECUTION_ID", request.execution_id.to_string())
            .env(TOKEN_ENV, &token)
            .env("CORECHECK_JOB_DEFINITION", &request.definition_ref)
            .env("CORECHECK_JOB_QUEUE", &request.queue_ref)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            OrchestratorError::Submission(format!("failed to spawn '{}': {}", self.program, e))
        })?;
        let pgid = child.id().ok_or_else(|| {
            OrchestratorError::Submission(format!("'{}' exited before it was tracked", self.program))
        })?;
        let job_id = format!("job-{}-pg{}", token, pgid);

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                // A job that ignores its params closes stdin early
                let _ = stdin.write_all(&payload).await;
            });
        }
        let stdout = child.stdout.take().map(read_all);
        let stderr = child.stderr.take().map(read_all);

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        self.jobs.insert(
            job_id.clone(),
            ProcessJob {
                outcome: outcome_rx,
                kill: Some(kill_tx),
            },
        );

        info!(
            "Spawned job {} for execution {} ({} {:?})",
            job_id, request.execution_id, self.program, self.args
        );

        let monitored_id = job_id.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => Some(status),
                Ok(()) = kill_rx => None,
            };

            let outcome = match exit {
                None => {
                    if let Err(e) = kill_group(pgid) {
                        warn!("Failed to signal process group of job {}: {}", monitored_id, e);
                    }
                    if let Err(e) = child.kill().await {
                        debug!("Job {} already gone: {}", monitored_id, e);
                    }
                    JobOutcome::failed(&monitored_id, "terminated by request")
                }
                Some(Err(e)) => JobOutcome::failed(&monitored_id, format!("wait failed: {}", e)),
                Some(Ok(status)) => {
                    let stdout = collect(stdout).await;
                    let stderr = collect(stderr).await;
                    if status.success() {
                        JobOutcome::succeeded(&monitored_id, parse_output(&stdout))
                    } else {
                        let tail_start = stderr.len().saturating_sub(STDERR_TAIL);
                        JobOutcome::failed(&monitored_id, format!("job exited with {}", status))
                            .with_diagnostics(json!({
                                "exit_code": status.code(),
                                "stderr": String::from_utf8_lossy(&stderr[tail_start..]),
                            }))
                    }
                }
            };

            debug!("Job {} finished: {}", monitored_id, outcome.status);
            let _ = outcome_tx.send(Some(outcome));
        });

        Ok(job_id)
    }

    async fn wait(&self, job_id: &str) -> Result<JobOutcome> {
        let mut rx = match self.jobs.get(job_id) {
            Some(job) => job.outcome.clone(),
            None => {
                return Ok(JobOutcome::failed(
                    job_id,
                    "job is not tracked by this backend (lost on restart?)",
                ))
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| OrchestratorError::Submission(format!("monitor for {} vanished", job_id)))?
            .clone()
            .ok_or_else(|| OrchestratorError::Submission(format!("no outcome for {}", job_id)))?;

        self.jobs.remove(job_id);
        Ok(outcome)
    }

    fn supports_terminate(&self) -> bool {
        true
    }

    async fn terminate(&self, job_id: &str) -> Result<()> {
        if self.signal_local(job_id) {
            info!("Terminating job {}", job_id);
            return Ok(());
        }

        // Spawned by another process; reach it through its process group
        let (token, pgid) = parse_job_id(job_id).ok_or_else(|| {
            OrchestratorError::Submission(format!("job id {} carries no process group", job_id))
        })?;
        if !group_belongs_to(pgid, token) {
            debug!("Process group {} no longer runs job {}", pgid, job_id);
            return Ok(());
        }
        info!("Terminating job {} through process group {}", job_id, pgid);
        kill_group(pgid).map_err(|e| {
            OrchestratorError::Submission(format!("cannot terminate job {}: {}", job_id, e))
        })
    }

    async fn discard(&self, job_id: &str) {
        if let Err(e) = self.terminate(job_id).await {
            warn!("Discarded job {} may still be running: {}", job_id, e);
        }
        self.jobs.remove(job_id);
    }
}

/// `job-<token>-pg<pgid>` → `(token, pgid)`
fn parse_job_id(job_id: &str) -> Option<(&str, u32)> {
    let (prefix, pgid) = job_id.rsplit_once("-pg")?;
    let token = prefix.strip_prefix("job-")?;
    let pgid = pgid.parse().ok().filter(|pgid| *pgid > 1)?;
    Some((token, pgid))
}

/// Whether the group leader still runs the job with `token`
///
/// Guards against pid reuse on Linux. A leader that already exited cannot be
/// checked, but its group id is not handed out again while members remain.
#[cfg(target_os = "linux")]
fn group_belongs_to(pgid: u32, token: &str) -> bool {
    match std::fs::read(format!("/proc/{}/environ", pgid)) {
        // Zombie leaders expose an empty environment
        Ok(environ) if environ.is_empty() => true,
        Ok(environ) => {
            let expected = format!("{}={}", TOKEN_ENV, token);
            environ
                .split(|b| *b == 0)
                .any(|entry| entry == expected.as_bytes())
        }
        Err(_) => true,
    }
}

#[cfg(not(target_os = "linux"))]
fn group_belongs_to(_pgid: u32, _token: &str) -> bool {
    true
}

/// SIGKILL the whole process group; a group that is already gone is fine
#[cfg(unix)]
fn kill_group(pgid: u32) -> std::io::Result<()> {
    let result = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process groups are only available on unix",
    ))
}

fn read_all<R>(mut reader: R) -> tokio::task::JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        buf
    })
}

async fn collect(handle: Option<tokio::task::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

fn parse_output(stdout: &[u8]) -> Value {
    serde_json::from_slice(stdout)
        .unwrap_or_else(|_| json!({ "stdout": String::from_utf8_lossy(stdout).trim() }))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use corecheck_storage::JobStatus;
    use std::time::Duration;

    fn shell(script: &str) -> ProcessBackend {
        ProcessBackend::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn request(params: Value) -> JobRequest {
        JobRequest {
            execution_id: Uuid::new_v4(),
            definition_ref: "coverage:v1".to_string(),
            queue_ref: "default".to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn test_stdout_json_becomes_output() {
        let backend = shell(r#"cat >/dev/null; echo '{"output_ref":"file:///tmp/cov.json"}'"#);
        let job_id = backend.submit(request(json!({"target": "repo-42"}))).await.unwrap();

        let outcome = backend.wait(&job_id).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(outcome.output_ref.as_deref(), Some("file:///tmp/cov.json"));
        assert_eq!(backend.tracked_jobs(), 0);
    }

    #[tokio::test]
    async fn test_params_arrive_on_stdin() {
        let backend = shell("cat");
        let job_id = backend.submit(request(json!({"target": "repo-42"}))).await.unwrap();

        let outcome = backend.wait(&job_id).await.unwrap();
        assert_eq!(outcome.output, Some(json!({"target": "repo-42"})));
    }

    #[tokio::test]
    async fn test_nonzero_exit_keeps_stderr() {
        let backend = shell("echo 'no tests found' >&2; exit 3");
        let job_id = backend.submit(request(json!({}))).await.unwrap();

        let outcome = backend.wait(&job_id).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        let diagnostics = outcome.diagnostics.unwrap();
        assert_eq!(diagnostics["exit_code"], 3);
        assert!(diagnostics["stderr"].as_str().unwrap().contains("no tests found"));
    }

    #[tokio::test]
    async fn test_terminate_stops_long_job() {
        let backend = shell("sleep 30");
        let job_id = backend.submit(request(json!({}))).await.unwrap();
        let mut outcome = backend.jobs.get(&job_id).unwrap().outcome.clone();

        backend.terminate(&job_id).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), outcome.wait_for(Option::is_some))
            .await
            .expect("terminated job should finish promptly")
            .unwrap()
            .clone()
            .unwrap();

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.message.as_deref(), Some("terminated by request"));
        assert_eq!(backend.tracked_jobs(), 0);
    }

    #[tokio::test]
    async fn test_terminate_from_another_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("finished");
        let spawner = shell(&format!("sleep 1; touch '{}'", marker.display()));
        let job_id = spawner.submit(request(json!({}))).await.unwrap();

        // A different process only knows the job id from the store
        let other = shell("true");
        other.terminate(&job_id).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), spawner.wait(&job_id))
            .await
            .expect("killed job should be reaped promptly")
            .unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_terminate_finished_foreign_job_is_ok() {
        let spawner = shell("true");
        let job_id = spawner.submit(request(json!({}))).await.unwrap();
        spawner.wait(&job_id).await.unwrap();

        shell("true").terminate(&job_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_unparseable_job_id_is_error() {
        let err = shell("true").terminate("fn-1234").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Submission(_)));
    }

    #[tokio::test]
    async fn test_discard_kills_and_forgets() {
        let backend = shell("sleep 30");
        let job_id = backend.submit(request(json!({}))).await.unwrap();
        let (_, pgid) = parse_job_id(&job_id).unwrap();

        backend.discard(&job_id).await;
        assert_eq!(backend.tracked_jobs(), 0);

        // Group disappears once the monitor reaps the leader
        tokio::time::timeout(Duration::from_secs(5), async {
            while unsafe { libc::killpg(pgid as libc::pid_t, 0) } == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("process group should be gone");
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(parse_job_id("job-abc123-pg4242"), Some(("abc123", 4242)));
        assert_eq!(parse_job_id("job-abc123-pg1"), None);
        assert_eq!(parse_job_id("fn-abc123"), None);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_submission_error() {
        let backend = ProcessBackend::new("/nonexistent/coverage-runner", vec![]);
        let err = backend.submit(request(json!({}))).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Submission(_)));
    }

    #[tokio::test]
    async fn test_unknown_job_resolves_failed() {
        let backend = shell("true");
        let outcome = backend.wait("job-unknown").await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
    }
}
