//! Control socket.
//!
//! `renderpool serve` listens on a Unix socket and runs pool operations on
//! behalf of the one-shot subcommands, so every worker is a child of the
//! long-lived supervisor and its exit is reaped there.
//!
//! The protocol is newline-delimited JSON: one [`ControlRequest`] per line in,
//! one [`ControlResponse`] per line out. A connection may carry any number of
//! requests.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pool::{PoolError, PoolManager};

/// A pool operation sent to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Ensure { job_id: String, dataset_path: String },
    Stop { port: u16 },
    List,
    Info { job_id: String },
    /// Uses the supervisor's configured threshold when `threshold_hours` is
    /// absent.
    Sweep {
        #[serde(default)]
        threshold_hours: Option<f64>,
    },
    Purge { older_than_days: f64 },
}

/// Reply to one [`ControlRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok { result: Value },
    Error { error: String, message: String },
}

#[derive(Serialize)]
struct PurgeReport {
    purged: u64,
}

impl ControlResponse {
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            error: kind.into(),
            message: message.into(),
        }
    }

    fn from_result<T: Serialize>(result: Result<T, PoolError>) -> Self {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(result) => Self::Ok { result },
                Err(e) => Self::error("internal", format!("Failed to encode result: {e}")),
            },
            Err(e) => Self::error(e.kind(), e.detail()),
        }
    }
}

/// Errors on the control socket.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Control socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed control message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Supervisor closed the connection without replying")]
    Closed,

    #[error("A supervisor is already listening on {path}")]
    AlreadyServing { path: String },
}

impl ControlError {
    /// Nothing is listening on the socket.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
            )
        )
    }
}

/// Run one request against `manager`.
pub async fn dispatch(manager: &PoolManager, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::Ensure {
            job_id,
            dataset_path,
        } => ControlResponse::from_result(manager.ensure_worker(&job_id, &dataset_path).await),
        ControlRequest::Stop { port } => {
            ControlResponse::from_result(manager.stop_worker(port).await)
        }
        ControlRequest::List => ControlResponse::from_result(manager.list_workers().await),
        ControlRequest::Info { job_id } => {
            ControlResponse::from_result(manager.get_worker_info(&job_id).await)
        }
        ControlRequest::Sweep { threshold_hours } => {
            let hours = threshold_hours.unwrap_or(manager.config().inactivity_threshold_hours);
            ControlResponse::from_result(manager.sweep_inactive(hours).await)
        }
        ControlRequest::Purge { older_than_days } => ControlResponse::from_result(
            manager
                .purge_history(older_than_days)
                .await
                .map(|purged| PurgeReport { purged }),
        ),
    }
}

/// Bind `path` and serve requests until `shutdown` fires.
///
/// A leftover socket file from a dead supervisor is replaced; one that still
/// accepts connections is an error.
pub fn spawn_control_server(
    manager: Arc<PoolManager>,
    path: &Path,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, ControlError> {
    if path.exists() {
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            return Err(ControlError::AlreadyServing {
                path: path.display().to_string(),
            });
        }
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    let path = path.to_path_buf();

    Ok(tokio::spawn(async move {
        info!(path = %path.display(), "Control socket listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(&manager, stream).await {
                                debug!(error = %e, "Control connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept control connection"),
                },
                _ = shutdown.changed() => break,
            }
        }

        remove_socket(&path);
        info!("Control socket closed");
    }))
}

/// Send one request to the supervisor listening on `path` and wait for the
/// reply.
pub async fn send_request(
    path: &Path,
    request: &ControlRequest,
) -> Result<ControlResponse, ControlError> {
    let stream = UnixStream::connect(path).await?;
    let (read, mut write) = stream.into_split();

    write_message(&mut write, request).await?;
    write.shutdown().await?;

    let mut lines = BufReader::new(read).lines();
    let line = lines.next_line().await?.ok_or(ControlError::Closed)?;
    Ok(serde_json::from_str(&line)?)
}

async fn serve_connection(manager: &PoolManager, stream: UnixStream) -> Result<(), ControlError> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => {
                debug!(?request, "Control request");
                dispatch(manager, request).await
            }
            Err(e) => ControlResponse::error("invalid_request", format!("Malformed request: {e}")),
        };
        write_message(&mut write, &response).await?;
    }
    Ok(())
}

async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ControlError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(message)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove control socket");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_tagged_by_op() {
        let stop: ControlRequest = serde_json::from_str(r#"{"op":"stop","port":11111}"#).unwrap();
        assert_eq!(stop, ControlRequest::Stop { port: 11111 });

        let sweep: ControlRequest = serde_json::from_str(r#"{"op":"sweep"}"#).unwrap();
        assert_eq!(
            sweep,
            ControlRequest::Sweep {
                threshold_hours: None
            }
        );

        let ensure = serde_json::to_value(ControlRequest::Ensure {
            job_id: "job1".to_string(),
            dataset_path: "/data/a".to_string(),
        })
        .unwrap();
        assert_eq!(ensure["op"], "ensure");
        assert_eq!(ensure["dataset_path"], "/data/a");
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(serde_json::from_str::<ControlRequest>(r#"{"op":"reboot"}"#).is_err());
    }

    #[test]
    fn pool_errors_keep_their_kind() {
        let response = ControlResponse::from_result::<()>(Err(PoolError::PortExhaustion {
            start: 11111,
            end: 11116,
        }));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["outcome"], "error");
        assert_eq!(json["error"], "port_exhaustion");
        assert!(json["message"].as_str().unwrap().contains("11111-11116"));
    }

    #[tokio::test]
    async fn missing_socket_is_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = send_request(&dir.path().join("absent.sock"), &ControlRequest::List)
            .await
            .unwrap_err();
        assert!(err.is_unavailable(), "{err:?}");
    }
}
