use log::{debug, error};
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Connection timed out after {0:?}")]
    ConnectionTimeout(Duration),
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[from] io::Error),
}

pub type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// Opens the outbound leg for a "host:port" target.
pub type Connector = Arc<dyn Fn(String) -> ConnectFuture + Send + Sync>;

/// Plain TCP connect; name resolution happens inside the returned future.
pub fn tcp_connector() -> Connector {
    Arc::new(|addr: String| -> ConnectFuture {
        Box::pin(async move { TcpStream::connect(addr).await })
    })
}

/// Give up on `connect` after `timeout`. Whatever the future does (name
/// resolution included) counts against the same deadline.
pub async fn connect_with_timeout<F, T>(connect: F, timeout: Duration) -> Result<T, ConnectError>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ConnectError::ConnectionFailed(e)),
        Err(_) => Err(ConnectError::ConnectionTimeout(timeout)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToTarget => f.write_str("client->target"),
            Direction::TargetToClient => f.write_str("target->client"),
        }
    }
}

/// How the first finished direction of a relay ended. `direction` is
/// `None` when the copy task itself died (panic or cancellation).
#[derive(Debug)]
pub struct RelayOutcome {
    pub direction: Option<Direction>,
    pub result: io::Result<u64>,
}

/// Copy bytes both ways between `client` and `target` until either direction
/// stops.
///
/// Each direction runs as its own task. Once the first one finishes the other
/// is aborted and reaped, which drops the last halves of both streams and so
/// closes them.
pub async fn relay<A, B>(client: A, target: B) -> RelayOutcome
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (target_read, target_write) = tokio::io::split(target);

    let mut tasks = JoinSet::new();
    tasks.spawn(copy_one_way(
        client_read,
        target_write,
        Direction::ClientToTarget,
    ));
    tasks.spawn(copy_one_way(
        target_read,
        client_write,
        Direction::TargetToClient,
    ));

    let outcome = match tasks.join_next().await {
        Some(Ok(outcome)) => outcome,
        Some(Err(e)) => {
            error!("relay task failed: {}", e);
            RelayOutcome {
                direction: None,
                result: Err(io::Error::other(e)),
            }
        }
        None => unreachable!("relay spawns two copy tasks"),
    };

    tasks.shutdown().await;
    outcome
}

async fn copy_one_way<R, W>(mut reader: R, mut writer: W, direction: Direction) -> RelayOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = tokio::io::copy(&mut reader, &mut writer).await;
    match &result {
        Ok(bytes) => {
            debug!("{} finished: {} bytes", direction, bytes);
            // Pass the EOF on; the peer may already be gone.
            let _ = writer.shutdown().await;
        }
        Err(e) => debug!("{} error: {}", direction, e),
    }
    RelayOutcome {
        direction: Some(direction),
        result,
    }
}
