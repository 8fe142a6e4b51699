//! Git pack-protocol commands run on behalf of an SSH channel.
//!
//! This module handles:
//! - Parsing the exec command line sent by a git client
//! - Spawning `git upload-pack` / `git receive-pack` for the repository
//! - Pumping the child's stdio to and from the channel

use async_trait::async_trait;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const USER_ID_ENV: &str = "GIT_BRIDGE_USER_ID";
pub const GIT_PROTOCOL_ENV: &str = "GIT_PROTOCOL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitService {
    UploadPack,
    ReceivePack,
}

impl GitService {
    /// Name as sent by the client, e.g. `git-upload-pack`.
    pub fn command_name(&self) -> &'static str {
        match self {
            GitService::UploadPack => "git-upload-pack",
            GitService::ReceivePack => "git-receive-pack",
        }
    }

    /// Subcommand passed to the git binary.
    pub fn subcommand(&self) -> &'static str {
        match self {
            GitService::UploadPack => "upload-pack",
            GitService::ReceivePack => "receive-pack",
        }
    }
}

impl fmt::Display for GitService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unsupported command '{0}': only git-upload-pack and git-receive-pack are allowed")]
    Unsupported(String),

    #[error("{0} requires a repository argument")]
    MissingArgument(GitService),

    #[error("{0} takes exactly one repository argument")]
    TooManyArguments(GitService),

    #[error("unterminated quote in command")]
    UnterminatedQuote,

    #[error("empty command")]
    Empty,
}

/// A validated git exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommand {
    pub service: GitService,
    pub repository: String,
}

impl GitCommand {
    pub fn parse(command: &str) -> Result<Self, CommandError> {
        let words = split_command(command)?;
        let (name, args) = words.split_first().ok_or(CommandError::Empty)?;

        let service = match name.as_str() {
            "git-upload-pack" => GitService::UploadPack,
            "git-receive-pack" => GitService::ReceivePack,
            other => return Err(CommandError::Unsupported(other.to_string())),
        };

        match args {
            [] => Err(CommandError::MissingArgument(service)),
            [repository] if repository.is_empty() => Err(CommandError::MissingArgument(service)),
            [repository] => Ok(Self {
                service,
                repository: repository.clone(),
            }),
            _ => Err(CommandError::TooManyArguments(service)),
        }
    }

    /// Build the child process. `kill_on_drop` ties it to the session.
    pub fn command(&self, git_binary: &str, user_id: &str, git_protocol: Option<&str>) -> Command {
        let mut cmd = Command::new(git_binary);
        cmd.arg(self.service.subcommand())
            .arg(&self.repository)
            .env(USER_ID_ENV, user_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(protocol) = git_protocol {
            cmd.env(GIT_PROTOCOL_ENV, protocol);
        }
        cmd
    }
}

/// Split a command line the way a POSIX shell would, without expansions.
pub fn split_command(input: &str) -> Result<Vec<String>, CommandError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(CommandError::UnterminatedQuote),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err(CommandError::UnterminatedQuote),
                        },
                        Some(c) => current.push(c),
                        None => return Err(CommandError::UnterminatedQuote),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    current.push(c);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Sink for a running command's output.
#[async_trait]
pub trait ChannelOutput: Send + Sync {
    async fn stdout(&self, data: &[u8]) -> bool;
    async fn stderr(&self, data: &[u8]) -> bool;
    /// Report the exit status, then EOF and close.
    async fn finish(&self, exit_status: u32);
}

/// Map a child exit status to an SSH exit status.
pub fn exit_code(status: ExitStatus) -> u32 {
    match status.code() {
        Some(code) if code >= 0 => code as u32,
        _ => 255,
    }
}

async fn forward<R, O>(mut reader: R, output: &O, to_stderr: bool)
where
    R: AsyncRead + Unpin,
    O: ChannelOutput + ?Sized,
{
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let delivered = if to_stderr {
                    output.stderr(&buf[..n]).await
                } else {
                    output.stdout(&buf[..n]).await
                };
                if !delivered {
                    break;
                }
            }
            Err(e) => {
                warn!("Failed to read child output: {}", e);
                break;
            }
        }
    }
}

/// Wire a spawned child to a channel and wait for it.
///
/// Client data arrives on `stdin_rx`; dropping the sender closes the
/// child's stdin. Output is fully drained before `finish` is called.
pub async fn pump<O>(mut child: Child, mut stdin_rx: mpsc::Receiver<Vec<u8>>, output: &O) -> u32
where
    O: ChannelOutput + ?Sized,
{
    let stdin_task = child.stdin.take().map(|mut stdin| {
        tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
            }
            let _ = stdin.shutdown().await;
        })
    });

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::join!(
        async {
            if let Some(stdout) = stdout {
                forward(stdout, output, false).await;
            }
        },
        async {
            if let Some(stderr) = stderr {
                forward(stderr, output, true).await;
            }
        },
    );

    let status = match child.wait().await {
        Ok(status) => exit_code(status),
        Err(e) => {
            warn!("Failed to wait for git process: {}", e);
            255
        }
    };
    if let Some(task) = stdin_task {
        task.abort();
    }

    debug!(exit_status = status, "git process exited");
    output.finish(status).await;
    status
}

/// Records everything written to a channel.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct Recorder {
    pub stdout: std::sync::Mutex<Vec<u8>>,
    pub stderr: std::sync::Mutex<Vec<u8>>,
    pub finished: std::sync::Mutex<Option<u32>>,
}

#[cfg(test)]
#[async_trait]
impl ChannelOutput for Recorder {
    async fn stdout(&self, data: &[u8]) -> bool {
        self.stdout.lock().unwrap().extend_from_slice(data);
        true
    }

    async fn stderr(&self, data: &[u8]) -> bool {
        self.stderr.lock().unwrap().extend_from_slice(data);
        true
    }

    async fn finish(&self, exit_status: u32) {
        *self.finished.lock().unwrap() = Some(exit_status);
    }
}
