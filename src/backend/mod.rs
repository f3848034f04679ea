//! Isolation backends: where a session's commands actually run.

pub mod container;
pub mod directory;

use crate::config::BackendKind;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

pub use container::{ContainerBackend, ContainerRuntime, DockerCli};
pub use directory::DirectoryBackend;

/// Environment overrides for one command, applied in order.
pub type Env = Vec<(String, String)>;

const CHUNK_SIZE: usize = 4096;

/// Where a session lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BackendHandle {
    #[serde(rename_all = "camelCase")]
    Directory { home_dir: PathBuf },
    /// `home_dir` is the host side of the bind-mounted home.
    #[serde(rename_all = "camelCase")]
    Container {
        container_id: String,
        linux_user: String,
        uid: u32,
        home_dir: PathBuf,
    },
}

impl BackendHandle {
    /// Home directory as seen from the host.
    pub fn host_home(&self) -> &Path {
        match self {
            BackendHandle::Directory { home_dir } => home_dir,
            BackendHandle::Container { home_dir, .. } => home_dir,
        }
    }

    /// Home directory as seen by the running command.
    pub fn exec_home(&self) -> PathBuf {
        match self {
            BackendHandle::Directory { home_dir } => home_dir.clone(),
            BackendHandle::Container { linux_user, .. } => {
                PathBuf::from("/home").join(linux_user)
            }
        }
    }

    /// Owner files created on the host side should be handed to.
    pub fn owner_uid(&self) -> Option<u32> {
        match self {
            BackendHandle::Directory { .. } => None,
            BackendHandle::Container { uid, .. } => Some(*uid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A spawned command leading its own process group.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub child: Child,
    pub pgid: i32,
}

#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// True when handles do not depend on the user, so sessions can be
    /// allocated ahead of time.
    fn supports_prewarm(&self) -> bool;

    /// PATH entries appended after the session's private bin directory.
    fn base_path(&self) -> String;

    /// Allocates (or re-resolves) the execution target for a session.
    async fn resolve(&self, session_id: &str, user_id: &str) -> Result<BackendHandle>;

    /// Prepares the home behind `handle`. Idempotent.
    async fn initialize(&self, handle: &BackendHandle) -> Result<()>;

    /// Gives the handle back. `preserve_data` keeps files on disk.
    async fn release(&self, handle: &BackendHandle, preserve_data: bool) -> Result<()>;

    /// Whether the target behind `handle` still exists.
    async fn handle_exists(&self, handle: &BackendHandle) -> bool;

    /// Starts `script` under bash in a new process group with piped output.
    fn spawn(&self, handle: &BackendHandle, script: &str, env: &Env) -> Result<SpawnedProcess>;

    /// Stops whatever runs behind `handle` that signalling the local
    /// process group cannot reach.
    async fn terminate(&self, _handle: &BackendHandle) -> Result<()> {
        Ok(())
    }

    /// Flushes backend state on shutdown.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Runs `script` to completion, collecting output.
    async fn exec(
        &self,
        handle: &BackendHandle,
        script: &str,
        env: &Env,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let mut process = self.spawn(handle, script, env)?;
        let mut output = ExecOutput::default();
        let drained = tokio::time::timeout(
            timeout,
            drain(&mut process.child, |stream, text| match stream {
                StreamKind::Stdout => output.stdout.push_str(&text),
                StreamKind::Stderr => output.stderr.push_str(&text),
            }),
        )
        .await;
        match drained {
            Ok(code) => {
                output.exit_code = code?;
                Ok(output)
            }
            Err(_) => Err(Error::ExecutionTimeout(timeout)),
        }
    }

    /// Runs `script`, pushing output chunks as they arrive. Returns the exit code.
    async fn exec_stream(
        &self,
        handle: &BackendHandle,
        script: &str,
        env: &Env,
        tx: mpsc::UnboundedSender<OutputChunk>,
    ) -> Result<i32> {
        let mut process = self.spawn(handle, script, env)?;
        let code = drain(&mut process.child, |stream, text| {
            let _ = tx.send(OutputChunk { stream, text });
        })
        .await?;
        Ok(code)
    }
}

/// Spawns `cmd` as the leader of a fresh process group.
pub(crate) fn spawn_command(mut cmd: Command) -> Result<SpawnedProcess> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    let child = cmd.spawn()?;
    let pgid = child
        .id()
        .map(|id| id as i32)
        .ok_or_else(|| Error::Io(io::Error::other("child exited before it was tracked")))?;
    Ok(SpawnedProcess { child, pgid })
}

/// Reads stdout and stderr concurrently until both close, handing each
/// decoded chunk to `on_chunk`, then reaps the child.
pub async fn drain<F>(child: &mut Child, mut on_chunk: F) -> io::Result<i32>
where
    F: FnMut(StreamKind, String) + Send,
{
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = vec![0u8; CHUNK_SIZE];
    let mut err_buf = vec![0u8; CHUNK_SIZE];
    let mut out_dec = Utf8Decoder::default();
    let mut err_dec = Utf8Decoder::default();

    loop {
        tokio::select! {
            read = read_some(&mut stdout, &mut out_buf), if stdout.is_some() => {
                let n = read?;
                if n == 0 {
                    stdout = None;
                    if let Some(rest) = out_dec.finish() {
                        on_chunk(StreamKind::Stdout, rest);
                    }
                } else if let Some(text) = out_dec.push(&out_buf[..n]) {
                    on_chunk(StreamKind::Stdout, text);
                }
            }
            read = read_some(&mut stderr, &mut err_buf), if stderr.is_some() => {
                let n = read?;
                if n == 0 {
                    stderr = None;
                    if let Some(rest) = err_dec.finish() {
                        on_chunk(StreamKind::Stderr, rest);
                    }
                } else if let Some(text) = err_dec.push(&err_buf[..n]) {
                    on_chunk(StreamKind::Stderr, text);
                }
            }
            else => break,
        }
    }

    let status = child.wait().await?;
    Ok(exit_code(status))
}

async fn read_some<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Signals map to the shell convention of 128 + signo.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// Holds back an incomplete trailing UTF-8 sequence until the next read.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut consumed = 0;
        loop {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(valid) => {
                    text.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_up_to = consumed + e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[consumed..valid_up_to]));
                    match e.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            consumed = valid_up_to + bad;
                        }
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            consumed = valid_up_to;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..consumed);
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_holds_split_multibyte_char() {
        let mut dec = Utf8Decoder::default();
        let snowman = "☃".as_bytes();
        assert_eq!(dec.push(&[b'a', snowman[0]]), Some("a".to_string()));
        assert_eq!(dec.push(&snowman[1..2]), None);
        assert_eq!(dec.push(&snowman[2..]), Some("☃".to_string()));
        assert_eq!(dec.finish(), None);
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut dec = Utf8Decoder::default();
        assert_eq!(dec.push(&[0xff, b'x']), Some("\u{fffd}x".to_string()));
    }

    #[test]
    fn decoder_keeps_split_char_after_invalid_byte() {
        let mut dec = Utf8Decoder::default();
        let snowman = "☃".as_bytes();
        assert_eq!(
            dec.push(&[0xff, snowman[0], snowman[1]]),
            Some("\u{fffd}".to_string())
        );
        assert_eq!(dec.push(&snowman[2..]), Some("☃".to_string()));
        assert_eq!(dec.finish(), None);
    }

    #[test]
    fn handle_homes() {
        let dir = BackendHandle::Directory {
            home_dir: PathBuf::from("/data/s1"),
        };
        assert_eq!(dir.exec_home(), PathBuf::from("/data/s1"));
        assert_eq!(dir.owner_uid(), None);

        let ctr = BackendHandle::Container {
            container_id: "c1".into(),
            linux_user: "user42".into(),
            uid: 2042,
            home_dir: PathBuf::from("/data/container-homes/user42"),
        };
        assert_eq!(ctr.exec_home(), PathBuf::from("/home/user42"));
        assert_eq!(ctr.host_home(), Path::new("/data/container-homes/user42"));
        assert_eq!(ctr.owner_uid(), Some(2042));
    }

    #[tokio::test]
    async fn drain_separates_streams_and_reports_exit() {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        let mut process = spawn_command(cmd).unwrap();
        let mut out = String::new();
        let mut err = String::new();
        let code = drain(&mut process.child, |stream, text| match stream {
            StreamKind::Stdout => out.push_str(&text),
            StreamKind::Stderr => err.push_str(&text),
        })
        .await
        .unwrap();
        assert_eq!(code, 3);
        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");
    }

    #[tokio::test]
    async fn signalled_child_maps_to_128_plus_signo() {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg("kill -TERM $$");
        let mut process = spawn_command(cmd).unwrap();
        let code = drain(&mut process.child, |_, _| {}).await.unwrap();
        assert_eq!(code, 128 + 15);
    }
}
