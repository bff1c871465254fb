#![deny(unsafe_code)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Control socket (§6): a UNIX domain socket accepting single-line
//! commands with line-delimited responses. Grounded on the original
//! `ControlServer`/`ControlCommand` dispatch table
//! (`lib/control/control.h`, `lib/control/control-server.h`), modeled
//! here as a small handler trait rather than a `command_name -> func`
//! hash table, since Rust's trait objects already give us that
//! dispatch for free.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{info, warn};

/// The minimum command set the core requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Trigger reconfiguration from the current config path.
    Reload,
    /// Emit counter snapshots.
    Stats,
    /// Emit values matching a stats key pattern.
    Query(String),
    /// Initiate graceful shutdown.
    Stop,
}

/// Errors raised while starting or running the control socket.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Underlying I/O failure (bind, accept, read, write).
    #[error("control socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlCommand {
    /// Parses one line of input into a command; unknown verbs are
    /// rejected at the transport layer by the caller, not here.
    pub fn parse(line: &str) -> Option<ControlCommand> {
        let line = line.trim();
        if line.eq_ignore_ascii_case("RELOAD") {
            Some(ControlCommand::Reload)
        } else if line.eq_ignore_ascii_case("STATS") {
            Some(ControlCommand::Stats)
        } else if line.eq_ignore_ascii_case("STOP") {
            Some(ControlCommand::Stop)
        } else if let Some(rest) = line
            .strip_prefix("QUERY ")
            .or_else(|| line.strip_prefix("query "))
        {
            Some(ControlCommand::Query(rest.trim().to_string()))
        } else {
            None
        }
    }
}

/// Implemented by whatever owns the engine (e.g. the main loop) to
/// execute control commands and produce a line-delimited response.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    /// Executes `command`, returning the lines of its response (each
    /// written back without embedded newlines).
    async fn handle(&self, command: ControlCommand) -> Vec<String>;
}

/// The control socket listener.
pub struct ControlServer {
    socket_path: PathBuf,
    handler: Arc<dyn ControlHandler>,
}

impl ControlServer {
    /// Builds a server bound (on `serve`) to `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>, handler: Arc<dyn ControlHandler>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handler,
        }
    }

    /// Path of the UNIX socket this server will listen on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the socket and serves connections until the listener is
    /// dropped or an I/O error occurs. Removes a stale socket file left
    /// over from a previous run before binding.
    pub async fn serve(self: Arc<Self>) -> Result<(), ControlError> {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "control socket listening");
        loop {
            let (stream, _addr) = listener.accept().await?;
            let handler = self.handler.clone();
            let _ = tokio::spawn(async move {
                if let Err(err) = serve_connection(stream, handler).await {
                    warn!(error = %err, "control connection ended with an error");
                }
            });
        }
    }
}

async fn serve_connection(
    stream: tokio::net::UnixStream,
    handler: Arc<dyn ControlHandler>,
) -> Result<(), ControlError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        match ControlCommand::parse(&line) {
            Some(command) => {
                let response = handler.handle(command).await;
                for line in response {
                    write_half.write_all(line.as_bytes()).await?;
                    write_half.write_all(b"\n").await?;
                }
                write_half.write_all(b".\n").await?;
            }
            None => {
                write_half
                    .write_all(format!("ERROR unknown command: {line}\n").as_bytes())
                    .await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixStream;

    #[test]
    fn parses_known_commands() {
        assert_eq!(ControlCommand::parse("RELOAD"), Some(ControlCommand::Reload));
        assert_eq!(ControlCommand::parse("stats"), Some(ControlCommand::Stats));
        assert_eq!(
            ControlCommand::parse("QUERY foo.*"),
            Some(ControlCommand::Query("foo.*".to_string()))
        );
        assert_eq!(ControlCommand::parse("STOP"), Some(ControlCommand::Stop));
        assert_eq!(ControlCommand::parse("NONSENSE"), None);
    }

    struct RecordingHandler {
        seen: Mutex<Vec<ControlCommand>>,
    }

    #[async_trait]
    impl ControlHandler for RecordingHandler {
        async fn handle(&self, command: ControlCommand) -> Vec<String> {
            self.seen.lock().unwrap().push(command.clone());
            match command {
                ControlCommand::Stats => vec!["processed=3".to_string(), "dropped=0".to_string()],
                _ => vec!["OK".to_string()],
            }
        }
    }

    #[tokio::test]
    async fn serves_stats_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("control.sock");
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let server = Arc::new(ControlServer::new(&socket_path, handler.clone()));
        let serve_task = tokio::spawn(server.clone().serve());

        // Give the listener a moment to bind.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        client.write_all(b"STATS\n").await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]);
        assert!(response.contains("processed=3"));
        assert!(response.contains('.'));
        assert_eq!(handler.seen.lock().unwrap().as_slice(), &[ControlCommand::Stats]);

        serve_task.abort();
    }
}
