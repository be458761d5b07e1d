use log::info;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task;

use crate::common::config::Config;
use crate::net::conn::Connection;
use crate::proxy::socks5::Socks5Proxy;

#[derive(Error, Debug)]
pub enum TcpProxyError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("{0}")]
    Socks5ProxyError(#[from] crate::proxy::socks5::Socks5ProxyError),
}

pub struct TcpProxy {
    socks5: Arc<Socks5Proxy>,
    semaphore: Arc<Semaphore>,
}

impl TcpProxy {
    pub fn new(config: Arc<Config>) -> Self {
        TcpProxy {
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            socks5: Arc::new(Socks5Proxy::new(config)),
        }
    }

    /// Accept connections until Ctrl-C / SIGINT is received.
    pub async fn run(&self, listener: TcpListener) {
        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
        })
        .await;
    }

    /// Accept connections until `shutdown` resolves. Sessions already running
    /// are left to finish on their own.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        match listener.local_addr() {
            Ok(addr) => info!("SOCKS5 proxy listening on {}", addr),
            Err(e) => log::warn!("Listening on unknown address: {}", e),
        }

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let permit = match self.semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    log::warn!("Max connections reached, rejecting {}", addr);
                                    drop(stream);
                                    continue;
                                }
                            };
                            let socks5 = self.socks5.clone();
                            task::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, addr, socks5).await {
                                    log::error!("{}: {}", addr, e);
                                }
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            log::error!("Accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }

        info!("Stopped accepting new connections");
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        socks5: Arc<Socks5Proxy>,
    ) -> Result<(), TcpProxyError> {
        info!("{}: connected", addr);
        stream.set_nodelay(true)?;
        socks5.handle_connection(Connection::new(stream, addr)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    async fn start(config: Config) -> (SocketAddr, oneshot::Sender<()>, task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = TcpProxy::new(Arc::new(config));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            proxy
                .serve(listener, async {
                    let _ = stop_rx.await;
                })
                .await;
        });
        (addr, stop_tx, handle)
    }

    /// Echo server that answers every chunk it receives.
    async fn start_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_end_to_end_with_auth() {
        let echo_addr = start_echo().await;
        let (proxy_addr, stop_tx, handle) = start(Config {
            username: Some("bob".to_string()),
            password: Some("hunter2".to_string()),
            allow_loopback: true,
            ..Config::default()
        })
        .await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();

        client.write_all(&[5, 2, 0, 2]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, 2]);

        let mut login = vec![1, 3];
        login.extend_from_slice(b"bob");
        login.push(7);
        login.extend_from_slice(b"hunter2");
        client.write_all(&login).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [1, 0]);

        let mut request = vec![5, 1, 0, 3, 9];
        request.extend_from_slice(b"localhost");
        request.extend_from_slice(&echo_addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

        for message in [&b"first"[..], &b"second message"[..], &[0u8, 255, 1, 254][..]] {
            client.write_all(message).await.unwrap();
            let mut echoed = vec![0u8; message.len()];
            client.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, message);
        }

        stop_tx.send(()).unwrap();
        handle.await.unwrap();

        // In-flight sessions outlive the accept loop.
        client.write_all(b"still here").await.unwrap();
        let mut echoed = [0u8; 10];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"still here");
    }

    #[tokio::test]
    async fn test_max_connections() {
        let (proxy_addr, stop_tx, handle) = start(Config {
            max_connections: 1,
            ..Config::default()
        })
        .await;

        let mut first = TcpStream::connect(proxy_addr).await.unwrap();
        first.write_all(&[5, 1, 0]).await.unwrap();
        let mut method = [0u8; 2];
        first.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, 0]);

        let mut second = TcpStream::connect(proxy_addr).await.unwrap();
        let _ = second.write_all(&[5, 1, 0]).await;
        let mut buf = [0u8; 2];
        let read = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
