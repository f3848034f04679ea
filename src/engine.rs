//! Command execution: single-flight per session, advisory timeouts,
//! streaming, and the interactive FIFO hand-off.

use crate::backend::{drain, BackendHandle, Env, IsolationBackend, SpawnedProcess, StreamKind};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pipeline::{CommandPipeline, EarlyResponse, Rewrite, SessionContext};
use crate::session::Session;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

/// Synthetic login name exported to every command.
const TERMINAL_USER: &str = "terminal-user";

/// Written by `cd`/`pwd` commands on exit so the stream can report where
/// the shell ended up.
const CWD_FILE: &str = ".isoterm-cwd";

#[derive(Debug, Clone)]
pub struct RunningProcess {
    pub pgid: i32,
    pub started: Instant,
    handle: BackendHandle,
    generation: u64,
}

/// At most one live process group per session.
#[derive(Default)]
pub struct ProcessTable {
    running: Mutex<HashMap<String, RunningProcess>>,
    generations: AtomicU64,
    backend: Option<Arc<dyn IsolationBackend>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also asks `backend` to stop work the local process group signal
    /// does not reach.
    pub fn with_backend(backend: Arc<dyn IsolationBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::default()
        }
    }

    /// Terminates whatever the session is running, then spawns the
    /// replacement while still holding the table, so two processes never
    /// overlap for one session.
    pub async fn replace<F>(
        &self,
        session_id: &str,
        handle: &BackendHandle,
        spawn: F,
    ) -> Result<(SpawnedProcess, u64)>
    where
        F: FnOnce() -> Result<SpawnedProcess>,
    {
        let mut running = self.running.lock().await;
        if let Some(old) = running.remove(session_id) {
            info!(session_id, pgid = old.pgid, "Terminating previous command");
            self.stop(session_id, &old).await;
        }
        let process = spawn()?;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        running.insert(
            session_id.to_string(),
            RunningProcess {
                pgid: process.pgid,
                started: Instant::now(),
                handle: handle.clone(),
                generation,
            },
        );
        Ok((process, generation))
    }

    /// Drops the entry if it still belongs to `generation`.
    pub async fn clear(&self, session_id: &str, generation: u64) {
        let mut running = self.running.lock().await;
        if running.get(session_id).map(|p| p.generation) == Some(generation) {
            running.remove(session_id);
        }
    }

    /// SIGTERM to the session's process group. False if nothing was running.
    pub async fn terminate(&self, session_id: &str) -> bool {
        let removed = self.running.lock().await.remove(session_id);
        match removed {
            Some(process) => {
                info!(session_id, pgid = process.pgid, "Terminating command");
                self.stop(session_id, &process).await;
                true
            }
            None => false,
        }
    }

    pub async fn terminate_all(&self) -> usize {
        let drained: Vec<_> = self.running.lock().await.drain().collect();
        for (session_id, process) in &drained {
            debug!(session_id = %session_id, pgid = process.pgid, "Terminating on shutdown");
            self.stop(session_id, process).await;
        }
        drained.len()
    }

    pub async fn get(&self, session_id: &str) -> Option<RunningProcess> {
        self.running.lock().await.get(session_id).cloned()
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        self.running.lock().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.running.lock().await.len()
    }

    async fn stop(&self, session_id: &str, process: &RunningProcess) {
        signal_group(process.pgid);
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.terminate(&process.handle).await {
                warn!(session_id, error = %e, "Backend could not stop the command");
            }
        }
    }
}

fn signal_group(pgid: i32) {
    match killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "killpg failed"),
    }
}

/// FIFO pair reported by the interactive helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FifoPair {
    pub cmd_fifo: String,
    pub resp_fifo: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { output: String, exit_code: i32 },
    Interactive(FifoPair),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Output { stream: StreamKind, text: String },
    Interactive(FifoPair),
    WorkingDirectory(String),
    Complete { exit_code: i32 },
}

pub struct ExecutionEngine {
    backend: Arc<dyn IsolationBackend>,
    pipeline: CommandPipeline,
    processes: Arc<ProcessTable>,
    command_timeout: Duration,
    interactive_helper: PathBuf,
    interactive_timeout: Duration,
    crypto_passphrase: Option<String>,
}

impl ExecutionEngine {
    pub fn new(config: &Config, backend: Arc<dyn IsolationBackend>, processes: Arc<ProcessTable>) -> Self {
        Self {
            backend,
            pipeline: CommandPipeline::new(config.enable_system_commands, config.scripts_dir.clone()),
            processes,
            command_timeout: config.command_timeout(),
            interactive_helper: config.interactive_helper.clone(),
            interactive_timeout: config.interactive_timeout(),
            crypto_passphrase: config.crypto_passphrase.clone(),
        }
    }

    pub fn processes(&self) -> &Arc<ProcessTable> {
        &self.processes
    }

    pub async fn terminate(&self, session_id: &str) -> bool {
        self.processes.terminate(session_id).await
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        self.processes.is_running(session_id).await
    }

    /// Runs `raw` to completion or until the command timeout. On timeout the
    /// process is left running and keeps its table entry until it exits.
    pub async fn run(&self, session: &Session, raw: &str) -> Result<Outcome> {
        let rewrite = self.rewrite(session, raw).await?;
        let prefix = notice_prefix(&rewrite.notices);

        if let Some(early) = rewrite.early {
            return match early {
                EarlyResponse::Message { output, exit_code } => Ok(Outcome::Completed {
                    output: format!("{prefix}{output}"),
                    exit_code,
                }),
                EarlyResponse::Forbidden(reason) => Err(Error::Forbidden(reason)),
                EarlyResponse::PathTraversal(path) => Err(Error::PathTraversal(path)),
            };
        }

        if rewrite.interactive {
            self.processes.terminate(&session.id).await;
            if let Some(fifos) = self.hand_off(session, &rewrite.command).await {
                return Ok(Outcome::Interactive(fifos));
            }
        }

        let (process, generation) = self.start(session, &rewrite.command).await?;
        let (done_tx, done_rx) = oneshot::channel();
        let processes = self.processes.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            let SpawnedProcess { mut child, pgid } = process;
            let mut stdout = String::new();
            let mut stderr = String::new();
            let code = drain(&mut child, |stream, text| match stream {
                StreamKind::Stdout => stdout.push_str(&text),
                StreamKind::Stderr => stderr.push_str(&text),
            })
            .await;
            processes.clear(&session_id, generation).await;
            debug!(session_id = %session_id, pgid, "Command exited");
            let _ = done_tx.send((code, stdout, stderr));
        });

        match tokio::time::timeout(self.command_timeout, done_rx).await {
            Ok(Ok((Ok(exit_code), stdout, stderr))) => {
                info!(session_id = %session.id, exit_code, "Command finished");
                if exit_code == 0 {
                    Ok(Outcome::Completed {
                        output: format!("{prefix}{stdout}{stderr}"),
                        exit_code,
                    })
                } else {
                    Err(Error::ExecutionFailed {
                        exit_code,
                        output: format!("{prefix}{}", failure_output(&stdout, &stderr)),
                    })
                }
            }
            Ok(Ok((Err(e), _, _))) => Err(Error::Io(e)),
            Ok(Err(_)) => Err(Error::Io(io::Error::other("command task ended without a result"))),
            Err(_) => {
                warn!(session_id = %session.id, timeout_secs = self.command_timeout.as_secs(), "Command timed out, leaving it running");
                Err(Error::ExecutionTimeout(self.command_timeout))
            }
        }
    }

    /// Starts `raw` and returns once it is running; events arrive on `tx`
    /// from a dedicated task, ending with `Complete`.
    pub async fn run_stream(
        &self,
        session: &Session,
        raw: &str,
        tx: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<()> {
        let rewrite = self.rewrite(session, raw).await?;
        for notice in &rewrite.notices {
            let _ = tx.send(StreamEvent::Output {
                stream: StreamKind::Stderr,
                text: format!("{notice}\n"),
            });
        }

        if let Some(early) = rewrite.early {
            return match early {
                EarlyResponse::Message { output, exit_code } => {
                    let _ = tx.send(StreamEvent::Output {
                        stream: StreamKind::Stdout,
                        text: output,
                    });
                    let _ = tx.send(StreamEvent::Complete { exit_code });
                    Ok(())
                }
                EarlyResponse::Forbidden(reason) => Err(Error::Forbidden(reason)),
                EarlyResponse::PathTraversal(path) => Err(Error::PathTraversal(path)),
            };
        }

        if rewrite.interactive {
            self.processes.terminate(&session.id).await;
            if let Some(fifos) = self.hand_off(session, &rewrite.command).await {
                let _ = tx.send(StreamEvent::Interactive(fifos));
                return Ok(());
            }
        }

        let cwd_file = reports_directory(&rewrite.command)
            .then(|| session.handle.host_home().join(CWD_FILE));
        let command = match &cwd_file {
            Some(path) => {
                let _ = tokio::fs::remove_file(path).await;
                format!("trap 'pwd > \"$HOME/{CWD_FILE}\" 2>/dev/null' EXIT\n{}", rewrite.command)
            }
            None => rewrite.command.clone(),
        };
        let (process, generation) = self.start(session, &command).await?;
        let processes = self.processes.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            let SpawnedProcess { mut child, pgid } = process;
            let code = drain(&mut child, |stream, text| {
                let _ = tx.send(StreamEvent::Output { stream, text });
            })
            .await;
            processes.clear(&session_id, generation).await;

            let exit_code = match code {
                Ok(code) => code,
                Err(e) => {
                    warn!(session_id = %session_id, pgid, error = %e, "Lost command output");
                    1
                }
            };

            if let Some(path) = cwd_file {
                if let Ok(dir) = tokio::fs::read_to_string(&path).await {
                    let dir = dir.trim();
                    if !dir.is_empty() {
                        let _ = tx.send(StreamEvent::WorkingDirectory(dir.to_string()));
                    }
                }
                let _ = tokio::fs::remove_file(&path).await;
            }
            let _ = tx.send(StreamEvent::Complete { exit_code });
        });
        Ok(())
    }

    async fn rewrite(&self, session: &Session, raw: &str) -> Result<Rewrite> {
        let pipeline = self.pipeline.clone();
        let ctx = SessionContext {
            home: session.handle.host_home().to_path_buf(),
            owner_uid: session.handle.owner_uid(),
        };
        let owned = raw.to_string();
        let rewrite = tokio::task::spawn_blocking(move || pipeline.rewrite(&owned, &ctx))
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))?;
        if rewrite.command != raw.trim() {
            debug!(session_id = %session.id, command = %rewrite.command, "Command rewritten");
        }
        Ok(rewrite)
    }

    async fn start(&self, session: &Session, command: &str) -> Result<(SpawnedProcess, u64)> {
        let script = script(command);
        let env = self.environment(&session.handle);
        let backend = self.backend.clone();
        let handle = session.handle.clone();
        let started = self
            .processes
            .replace(&session.id, &session.handle, move || backend.spawn(&handle, &script, &env))
            .await?;
        debug!(session_id = %session.id, pgid = started.0.pgid, "Command started");
        Ok(started)
    }

    fn environment(&self, handle: &BackendHandle) -> Env {
        let home = handle.exec_home().display().to_string();
        let mut env = vec![
            ("HOME".to_string(), home.clone()),
            ("PYTHONUSERBASE".to_string(), format!("{home}/.local")),
            (
                "PATH".to_string(),
                format!("{home}/.local/bin:{}", self.backend.base_path()),
            ),
            ("USER".to_string(), TERMINAL_USER.to_string()),
            ("TERM".to_string(), "xterm-256color".to_string()),
        ];
        if let Some(passphrase) = &self.crypto_passphrase {
            env.push(("OPENSSL_PASSPHRASE".to_string(), passphrase.clone()));
        }
        env
    }

    /// Asks the helper to set up FIFOs for `command`. `None` means run it
    /// inline instead.
    async fn hand_off(&self, session: &Session, command: &str) -> Option<FifoPair> {
        if !self.interactive_helper.is_file() {
            debug!(helper = %self.interactive_helper.display(), "No interactive helper installed");
            return None;
        }
        let mut cmd = Command::new(&self.interactive_helper);
        cmd.arg(command)
            .arg(&session.id)
            .current_dir(session.handle.host_home())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.interactive_timeout, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(output)) => {
                warn!(session_id = %session.id, status = %output.status, "Interactive helper failed");
                return None;
            }
            Ok(Err(e)) => {
                warn!(session_id = %session.id, error = %e, "Interactive helper did not start");
                return None;
            }
            Err(_) => {
                warn!(session_id = %session.id, "Interactive helper timed out");
                return None;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
        match (lines.next(), lines.next()) {
            (Some(cmd_fifo), Some(resp_fifo)) => {
                info!(session_id = %session.id, cmd_fifo, resp_fifo, "Interactive command handed off");
                Some(FifoPair {
                    cmd_fifo: cmd_fifo.to_string(),
                    resp_fifo: resp_fifo.to_string(),
                })
            }
            _ => {
                warn!(session_id = %session.id, "Interactive helper printed no FIFO paths");
                None
            }
        }
    }
}

/// Silently loads the session profile, then runs `command` from `$HOME`.
fn script(command: &str) -> String {
    format!(
        "{{ if [ -f \"$HOME/.profile\" ]; then . \"$HOME/.profile\"; \
         elif [ -f \"$HOME/.bashrc\" ]; then . \"$HOME/.bashrc\"; fi; }} >/dev/null 2>&1\n\
         cd \"$HOME\" || exit 1\n\
         {command}"
    )
}

fn reports_directory(command: &str) -> bool {
    matches!(command.split_whitespace().next(), Some("cd") | Some("pwd"))
}

fn notice_prefix(notices: &[String]) -> String {
    notices.iter().map(|n| format!("{n}\n")).collect()
}

fn failure_output(stdout: &str, stderr: &str) -> String {
    match (stdout.is_empty(), stderr.is_empty()) {
        (false, false) => format!("STDOUT:\n{stdout}\n\nERROR:\n{stderr}"),
        (true, false) => stderr.to_string(),
        (false, true) => stdout.to_string(),
        (true, true) => "Command failed with no error output".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DirectoryBackend;
    use crate::config::ResourceLimits;
    use chrono::Utc;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        engine: ExecutionEngine,
        session: Session,
    }

    async fn fixture(tweak: impl FnOnce(&mut Config)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config {
            user_data_dir: dir.path().join("data"),
            scripts_dir: dir.path().join("scripts"),
            interactive_helper: dir.path().join("no-helper"),
            ..Config::default()
        };
        tweak(&mut config);
        let backend: Arc<dyn IsolationBackend> = Arc::new(DirectoryBackend::new(
            &config.user_data_dir,
            &config.scripts_dir,
            ResourceLimits::default(),
        ));
        let handle = backend.resolve("s1", "alice").await.unwrap();
        backend.initialize(&handle).await.unwrap();
        let now = Utc::now();
        let session = Session {
            id: "s1".into(),
            user_id: "alice".into(),
            client_ip: "127.0.0.1".into(),
            created: now,
            last_accessed: now,
            handle,
            preserve_on_delete: false,
        };
        let engine = ExecutionEngine::new(&config, backend, Arc::new(ProcessTable::new()));
        Fixture {
            _dir: dir,
            engine,
            session,
        }
    }

    #[tokio::test]
    async fn echo_completes() {
        let f = fixture(|_| {}).await;
        let out = f.engine.run(&f.session, "echo hi").await.unwrap();
        assert_eq!(
            out,
            Outcome::Completed {
                output: "hi\n".into(),
                exit_code: 0
            }
        );
        assert!(!f.engine.is_running("s1").await);
    }

    #[tokio::test]
    async fn environment_points_at_session_home() {
        let f = fixture(|c| c.crypto_passphrase = Some("pw".into())).await;
        let Outcome::Completed { output, .. } = f
            .engine
            .run(&f.session, "echo $USER $OPENSSL_PASSPHRASE; echo $PYTHONUSERBASE")
            .await
            .unwrap()
        else {
            panic!("expected completion");
        };
        let home = f.session.handle.host_home().display().to_string();
        assert_eq!(output, format!("terminal-user pw\n{home}/.local\n"));
    }

    #[tokio::test]
    async fn failure_combines_streams() {
        let f = fixture(|_| {}).await;
        let err = f
            .engine
            .run(&f.session, "echo partial; echo broken >&2; exit 4")
            .await
            .unwrap_err();
        match err {
            Error::ExecutionFailed { exit_code, output } => {
                assert_eq!(exit_code, 4);
                assert_eq!(output, "STDOUT:\npartial\n\n\nERROR:\nbroken\n");
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = f.engine.run(&f.session, "false").await.unwrap_err();
        assert_eq!(err.to_string(), "Command failed with no error output");
    }

    #[tokio::test]
    async fn timeout_leaves_process_running() {
        let f = fixture(|c| c.command_timeout_secs = 1).await;
        let err = f.engine.run(&f.session, "sleep 30").await.unwrap_err();
        assert!(matches!(err, Error::ExecutionTimeout(_)));
        assert!(f.engine.is_running("s1").await);

        assert!(f.engine.terminate("s1").await);
        assert!(!f.engine.is_running("s1").await);
    }

    #[tokio::test]
    async fn new_command_terminates_previous() {
        let f = fixture(|_| {}).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        f.engine.run_stream(&f.session, "sleep 30", tx).await.unwrap();
        let first = f.engine.processes().get("s1").await.unwrap();

        let out = f.engine.run(&f.session, "echo next").await.unwrap();
        assert!(matches!(out, Outcome::Completed { exit_code: 0, .. }));

        let mut exit = None;
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Complete { exit_code } = event {
                exit = Some(exit_code);
            }
        }
        assert_eq!(exit, Some(128 + 15));
        assert_ne!(f.engine.processes().get("s1").await.map(|p| p.pgid), Some(first.pgid));
    }

    #[tokio::test]
    async fn stream_reports_output_then_completion() {
        let f = fixture(|_| {}).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        f.engine
            .run_stream(&f.session, "echo one; echo two", tx)
            .await
            .unwrap();

        let mut text = String::new();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Output { text: chunk, .. } = &event {
                text.push_str(chunk);
            }
            events.push(event);
        }
        assert_eq!(text, "one\ntwo\n");
        assert_eq!(events.last(), Some(&StreamEvent::Complete { exit_code: 0 }));
    }

    #[tokio::test]
    async fn cd_reports_directory() {
        let f = fixture(|_| {}).await;
        std::fs::create_dir_all(f.session.handle.host_home().join("projects")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        f.engine.run_stream(&f.session, "cd projects", tx).await.unwrap();

        let mut dir = None;
        while let Some(event) = rx.recv().await {
            if let StreamEvent::WorkingDirectory(path) = event {
                dir = Some(path);
            }
        }
        assert!(dir.unwrap().ends_with("/projects"));
        assert!(!f.session.handle.host_home().join(CWD_FILE).exists());
    }

    #[tokio::test]
    async fn directory_report_does_not_rerun_the_command() {
        let f = fixture(|_| {}).await;
        let home = f.session.handle.host_home().to_path_buf();
        std::fs::create_dir_all(home.join("projects")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        f.engine
            .run_stream(&f.session, "cd projects && sh -c 'echo x >> log'", tx)
            .await
            .unwrap();

        let mut dir = None;
        while let Some(event) = rx.recv().await {
            if let StreamEvent::WorkingDirectory(path) = event {
                dir = Some(path);
            }
        }
        assert!(dir.unwrap().ends_with("/projects"));
        assert_eq!(std::fs::read_to_string(home.join("projects/log")).unwrap(), "x\n");
    }

    #[tokio::test]
    async fn forbidden_runs_nothing() {
        let f = fixture(|_| {}).await;
        let err = f.engine.run(&f.session, "sudo rm -rf /").await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(ref m) if m.contains("disallowed operation")));
        assert!(!f.engine.is_running("s1").await);
    }

    #[tokio::test]
    async fn interactive_commands_use_helper_fifos() {
        let f = fixture(|_| {}).await;
        let helper = f._dir.path().join("helper");
        std::fs::write(&helper, "#!/bin/bash\necho /tmp/$2.cmd\necho /tmp/$2.resp\n").unwrap();
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut engine = f.engine;
        engine.interactive_helper = helper;
        let out = engine.run(&f.session, "ssh-keygen -t ed25519").await.unwrap();
        assert_eq!(
            out,
            Outcome::Interactive(FifoPair {
                cmd_fifo: "/tmp/s1.cmd".into(),
                resp_fifo: "/tmp/s1.resp".into(),
            })
        );
    }

    #[tokio::test]
    async fn interactive_hand_off_stops_the_running_command() {
        let f = fixture(|_| {}).await;
        let helper = f._dir.path().join("helper");
        std::fs::write(&helper, "#!/bin/bash\necho /tmp/$2.cmd\necho /tmp/$2.resp\n").unwrap();
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut engine = f.engine;
        engine.interactive_helper = helper;
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.run_stream(&f.session, "sleep 30", tx).await.unwrap();
        assert!(engine.is_running("s1").await);

        let out = engine.run(&f.session, "ssh-keygen -t ed25519").await.unwrap();
        assert!(matches!(out, Outcome::Interactive(_)));
        assert!(!engine.is_running("s1").await);

        let mut exit = None;
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Complete { exit_code } = event {
                exit = Some(exit_code);
            }
        }
        assert_eq!(exit, Some(128 + 15));
    }

    #[tokio::test]
    async fn missing_helper_falls_back_to_inline() {
        let f = fixture(|_| {}).await;
        // passwd with no tty fails inline rather than hanging.
        let result = f.engine.run(&f.session, "passwd --help").await;
        assert!(!matches!(result, Ok(Outcome::Interactive(_))));
    }

    #[test]
    fn failure_output_shapes() {
        assert_eq!(failure_output("", "e"), "e");
        assert_eq!(failure_output("o", ""), "o");
        assert_eq!(failure_output("o", "e"), "STDOUT:\no\n\nERROR:\ne");
    }
}
