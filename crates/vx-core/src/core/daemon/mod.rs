//! Worker daemon: persistent per-interpreter child processes holding a
//! configured activation, serving execute requests over a JSON-line
//! channel. Workers are started on demand, idle out, and evict LRU when
//! the pool is full.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::config::settings::DaemonSettings;
use crate::core::interpreters::{
    InterpreterRecord, ENV_ACTIVE_BUBBLE, ENV_SUBPROCESS, ENV_TARGET_INTERPRETER,
};

pub(crate) mod protocol;

pub use protocol::{WorkerRequest, WorkerRequestBody, WorkerResponse};

/// Inherited variables that could leak the parent's package state into a
/// worker; scrubbed before the worker's own activation env applies.
const SCRUBBED_ENV: &[&str] = &[
    "PYTHONPATH",
    "PYTHONHOME",
    "LD_LIBRARY_PATH",
    "DYLD_LIBRARY_PATH",
    ENV_ACTIVE_BUBBLE,
];

/// Minimal interpreter-side loop: read requests, answer them, flush.
pub const WORKER_BOOTSTRAP: &str = r#"
import contextlib, io, json, subprocess, sys
for line in sys.stdin:
    try:
        req = json.loads(line)
    except ValueError:
        continue
    rid = req.get("id", 0)
    op = req.get("op")
    if op == "shutdown":
        print(json.dumps({"id": rid, "ok": True, "stdout": "", "stderr": "", "code": 0}), flush=True)
        break
    if op == "ping":
        print(json.dumps({"id": rid, "ok": True, "stdout": "pong", "stderr": "", "code": 0}), flush=True)
        continue
    if op == "cancel":
        continue
    if op == "command":
        proc = subprocess.run(req.get("argv", []), capture_output=True, text=True)
        print(json.dumps({"id": rid, "ok": proc.returncode == 0, "stdout": proc.stdout, "stderr": proc.stderr, "code": proc.returncode}), flush=True)
        continue
    out, err, code = io.StringIO(), io.StringIO(), 0
    try:
        with contextlib.redirect_stdout(out), contextlib.redirect_stderr(err):
            exec(req.get("code", ""), {"__name__": "__main__"})
    except SystemExit as exc:
        code = int(exc.code or 0)
    except BaseException as exc:
        err.write(repr(exc))
        code = 1
    print(json.dumps({"id": rid, "ok": code == 0, "stdout": out.getvalue(), "stderr": err.getvalue(), "code": code}), flush=True)
"#;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("[VX600] worker failure: {0}")]
    Worker(String),
    #[error("[VX601] worker request timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("[VX900] request cancelled")]
    Cancelled,
    #[error("[VX200] {0}")]
    Io(#[from] anyhow::Error),
}

/// How to spawn a worker process.
#[derive(Clone, Debug)]
pub struct WorkerLauncher {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub interpreter_version: String,
}

impl WorkerLauncher {
    pub fn for_interpreter(record: &InterpreterRecord) -> Self {
        Self {
            program: record.executable_path.clone(),
            args: vec!["-c".to_string(), WORKER_BOOTSTRAP.to_string()],
            interpreter_version: record.version.clone(),
        }
    }

    /// Direct launcher, used by tests and by embedders with their own
    /// bootstrap.
    pub fn custom(program: PathBuf, args: Vec<String>, interpreter_version: String) -> Self {
        Self {
            program,
            args,
            interpreter_version,
        }
    }
}

/// Identity plus activation environment for one worker slot.
#[derive(Clone, Debug, Default)]
pub struct WorkerSpec {
    /// `name==version` of the bubble this worker holds, if any.
    pub bubble: Option<String>,
    /// Activation environment applied after scrubbing.
    pub env: Vec<(String, String)>,
}

impl WorkerSpec {
    fn key(&self) -> String {
        self.bubble.clone().unwrap_or_else(|| "-".to_string())
    }
}

/// Activation environment for a worker that should hold `spec`'s bubble:
/// the bubble root shadows the main environment on the module path.
pub fn worker_spec_for_bubble(
    settings: &crate::core::config::settings::InterpreterSettings,
    spec: &vx_domain::PackageSpec,
) -> WorkerSpec {
    let dir = crate::core::bubble::bubble_dir(&settings.bubble_root, spec);
    let sep = if cfg!(windows) { ";" } else { ":" };
    WorkerSpec {
        bubble: Some(spec.to_string()),
        env: vec![(
            "PYTHONPATH".to_string(),
            format!(
                "{}{}{}",
                dir.display(),
                sep,
                settings.install_root.display()
            ),
        )],
    }
}

type Pending = Arc<Mutex<HashMap<u64, mpsc::Sender<WorkerResponse>>>>;

struct Worker {
    child: Child,
    stdin: ChildStdin,
    pending: Pending,
    next_id: u64,
    served: u64,
    last_used: Instant,
}

impl Worker {
    fn alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn send(&mut self, request: &WorkerRequest) -> Result<(), DaemonError> {
        let mut line = serde_json::to_string(request)
            .map_err(|err| DaemonError::Worker(err.to_string()))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .context("failed to write to worker stdin")
            .map_err(DaemonError::Io)?;
        self.stdin
            .flush()
            .context("failed to flush worker stdin")
            .map_err(DaemonError::Io)?;
        Ok(())
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Async request handle. Waiting consumes it; cancelling closes it.
#[derive(Debug)]
pub struct ExecHandle {
    id: u64,
    worker_key: String,
    rx: mpsc::Receiver<WorkerResponse>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkerStatus {
    pub bubble: Option<String>,
    pub interpreter: String,
    pub served: u64,
    pub idle_secs: u64,
    pub alive: bool,
}

pub struct WorkerPool {
    settings: DaemonSettings,
    launcher: WorkerLauncher,
    workers: Mutex<HashMap<String, Worker>>,
}

impl WorkerPool {
    pub fn new(settings: DaemonSettings, launcher: WorkerLauncher) -> Self {
        Self {
            settings,
            launcher,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Blocking execute with the pool's configured timeout.
    pub fn execute(
        &self,
        spec: &WorkerSpec,
        body: WorkerRequestBody,
    ) -> Result<WorkerResponse, DaemonError> {
        let handle = self.execute_async(spec, body)?;
        self.wait(handle, self.settings.request_timeout)
    }

    /// Non-blocking execute; the response arrives on the handle.
    pub fn execute_async(
        &self,
        spec: &WorkerSpec,
        body: WorkerRequestBody,
    ) -> Result<ExecHandle, DaemonError> {
        let mut workers = self.workers.lock().expect("pool poisoned");
        self.reap_idle(&mut workers);
        let key = spec.key();

        let needs_spawn = match workers.get_mut(&key) {
            Some(worker) => !worker.alive(),
            None => true,
        };
        if needs_spawn {
            if let Some(mut dead) = workers.remove(&key) {
                debug!(worker = %key, "restarting dead worker");
                dead.kill();
            }
            self.evict_for_capacity(&mut workers);
            workers.insert(key.clone(), self.spawn(spec)?);
        }

        let worker = workers.get_mut(&key).expect("worker just ensured");
        worker.next_id += 1;
        worker.served += 1;
        worker.last_used = Instant::now();
        let id = worker.next_id;
        let (tx, rx) = mpsc::channel();
        worker
            .pending
            .lock()
            .expect("pending poisoned")
            .insert(id, tx);
        worker.send(&WorkerRequest { id, body })?;
        Ok(ExecHandle {
            id,
            worker_key: key,
            rx,
        })
    }

    pub fn wait(
        &self,
        handle: ExecHandle,
        timeout: Duration,
    ) -> Result<WorkerResponse, DaemonError> {
        match handle.rx.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.forget(&handle);
                Err(DaemonError::Timeout {
                    seconds: timeout.as_secs(),
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(DaemonError::Cancelled),
        }
    }

    /// Cooperative cancellation: the pending slot closes (so `wait`
    /// returns `Cancelled`) and the worker is told to stop the request.
    pub fn cancel(&self, handle: &ExecHandle) {
        self.forget(handle);
        let mut workers = self.workers.lock().expect("pool poisoned");
        if let Some(worker) = workers.get_mut(&handle.worker_key) {
            let _ = worker.send(&WorkerRequest {
                id: 0,
                body: WorkerRequestBody::Cancel { target: handle.id },
            });
        }
    }

    pub fn status(&self) -> Vec<WorkerStatus> {
        let mut workers = self.workers.lock().expect("pool poisoned");
        let mut out = Vec::new();
        for (key, worker) in workers.iter_mut() {
            out.push(WorkerStatus {
                bubble: (key.as_str() != "-").then(|| key.clone()),
                interpreter: self.launcher.interpreter_version.clone(),
                served: worker.served,
                idle_secs: worker.last_used.elapsed().as_secs(),
                alive: worker.alive(),
            });
        }
        out.sort_by(|a, b| a.bubble.cmp(&b.bubble));
        out
    }

    pub fn shutdown(&self) {
        let mut workers = self.workers.lock().expect("pool poisoned");
        for (key, mut worker) in workers.drain() {
            let _ = worker.send(&WorkerRequest {
                id: 0,
                body: WorkerRequestBody::Shutdown,
            });
            worker.kill();
            debug!(worker = %key, "worker shut down");
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().expect("pool poisoned").len()
    }

    fn forget(&self, handle: &ExecHandle) {
        let workers = self.workers.lock().expect("pool poisoned");
        if let Some(worker) = workers.get(&handle.worker_key) {
            worker
                .pending
                .lock()
                .expect("pending poisoned")
                .remove(&handle.id);
        }
    }

    fn spawn(&self, spec: &WorkerSpec) -> Result<Worker, DaemonError> {
        let mut command = Command::new(&self.launcher.program);
        command.args(&self.launcher.args);
        for var in SCRUBBED_ENV {
            command.env_remove(var);
        }
        command.env(ENV_SUBPROCESS, "1");
        command.env(ENV_TARGET_INTERPRETER, &self.launcher.interpreter_version);
        if let Some(bubble) = &spec.bubble {
            command.env(ENV_ACTIVE_BUBBLE, bubble);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::null());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn worker {}", self.launcher.program.display()))
            .map_err(DaemonError::Io)?;
        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let routes = Arc::clone(&pending);
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let Ok(response) = serde_json::from_str::<WorkerResponse>(&line) else {
                    continue;
                };
                let sender = routes.lock().expect("pending poisoned").remove(&response.id);
                if let Some(sender) = sender {
                    let _ = sender.send(response);
                }
            }
            // Worker exited: wake every outstanding request.
            routes.lock().expect("pending poisoned").clear();
        });

        debug!(bubble = ?spec.bubble, "spawned worker");
        Ok(Worker {
            child,
            stdin,
            pending,
            next_id: 0,
            served: 0,
            last_used: Instant::now(),
        })
    }

    fn reap_idle(&self, workers: &mut HashMap<String, Worker>) {
        let idle_timeout = self.settings.idle_timeout;
        let stale: Vec<String> = workers
            .iter()
            .filter(|(_, worker)| worker.last_used.elapsed() >= idle_timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(mut worker) = workers.remove(&key) {
                debug!(worker = %key, "reaping idle worker");
                worker.kill();
            }
        }
    }

    fn evict_for_capacity(&self, workers: &mut HashMap<String, Worker>) {
        while workers.len() >= self.settings.max_workers {
            let Some(lru) = workers
                .iter()
                .min_by_key(|(_, worker)| worker.last_used)
                .map(|(key, _)| key.clone())
            else {
                return;
            };
            warn!(worker = %lru, "pool full; evicting least-recently-used worker");
            if let Some(mut worker) = workers.remove(&lru) {
                worker.kill();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Shell stub speaking the worker protocol.
    fn stub_worker(dir: &Path) -> PathBuf {
        let path = dir.join("worker-stub");
        fs::write(
            &path,
            r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"op":"shutdown"'*) printf '{"id":%s,"ok":true,"stdout":"","stderr":"","code":0}\n' "$id"; exit 0;;
    *'"op":"ping"'*) printf '{"id":%s,"ok":true,"stdout":"pong","stderr":"","code":0}\n' "$id";;
    *'"op":"cancel"'*) ;;
    *) printf '{"id":%s,"ok":true,"stdout":"ran","stderr":"","code":0}\n' "$id";;
  esac
done
"#,
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn pool(dir: &Path, settings: DaemonSettings) -> WorkerPool {
        WorkerPool::new(
            settings,
            WorkerLauncher::custom(stub_worker(dir), vec![], "3.11".to_string()),
        )
    }

    #[test]
    fn ping_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let pool = pool(temp.path(), DaemonSettings::default());
        let response = pool
            .execute(&WorkerSpec::default(), WorkerRequestBody::Ping)
            .unwrap();
        assert!(response.ok);
        assert_eq!(response.stdout, "pong");
    }

    #[test]
    fn worker_is_reused_across_requests() {
        let temp = tempfile::tempdir().unwrap();
        let pool = pool(temp.path(), DaemonSettings::default());
        let spec = WorkerSpec::default();
        pool.execute(&spec, WorkerRequestBody::Ping).unwrap();
        pool.execute(&spec, WorkerRequestBody::Ping).unwrap();
        assert_eq!(pool.worker_count(), 1);
        let status = pool.status();
        assert_eq!(status[0].served, 2);
    }

    #[test]
    fn pool_enforces_capacity_with_lru_eviction() {
        let temp = tempfile::tempdir().unwrap();
        let settings = DaemonSettings {
            max_workers: 1,
            ..DaemonSettings::default()
        };
        let pool = pool(temp.path(), settings);
        let first = WorkerSpec {
            bubble: Some("a==1.0".to_string()),
            env: vec![],
        };
        let second = WorkerSpec {
            bubble: Some("b==2.0".to_string()),
            env: vec![],
        };
        pool.execute(&first, WorkerRequestBody::Ping).unwrap();
        pool.execute(&second, WorkerRequestBody::Ping).unwrap();
        assert_eq!(pool.worker_count(), 1);
        let status = pool.status();
        assert_eq!(status[0].bubble.as_deref(), Some("b==2.0"));
    }

    #[test]
    fn cancel_closes_the_handle() {
        let temp = tempfile::tempdir().unwrap();
        let pool = pool(temp.path(), DaemonSettings::default());
        let spec = WorkerSpec::default();
        // The stub ignores cancel ops, so only the closed channel reports.
        let handle = pool
            .execute_async(
                &spec,
                WorkerRequestBody::Cancel { target: 999 },
            )
            .unwrap();
        pool.cancel(&handle);
        let err = pool.wait(handle, Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, DaemonError::Cancelled));
    }

    #[test]
    fn idle_workers_are_reaped() {
        let temp = tempfile::tempdir().unwrap();
        let settings = DaemonSettings {
            idle_timeout: Duration::from_millis(50),
            ..DaemonSettings::default()
        };
        let pool = pool(temp.path(), settings);
        let spec = WorkerSpec::default();
        pool.execute(&spec, WorkerRequestBody::Ping).unwrap();
        assert_eq!(pool.worker_count(), 1);
        std::thread::sleep(Duration::from_millis(120));
        // The reaper runs on the next pool access.
        let response = pool.execute(&spec, WorkerRequestBody::Ping).unwrap();
        assert!(response.ok);
        assert_eq!(pool.status()[0].served, 1, "fresh worker after reap");
    }

    #[test]
    fn async_execute_and_await() {
        let temp = tempfile::tempdir().unwrap();
        let pool = pool(temp.path(), DaemonSettings::default());
        let handle = pool
            .execute_async(
                &WorkerSpec::default(),
                WorkerRequestBody::Exec {
                    code: "print('x')".to_string(),
                },
            )
            .unwrap();
        let response = pool.wait(handle, Duration::from_secs(5)).unwrap();
        assert_eq!(response.stdout, "ran");
    }
}
