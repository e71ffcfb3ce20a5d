//! Accept loop

use l7proxify_shared::Result;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::policy::SharedRules;
use crate::session::{ProxySession, SessionOptions};

pub struct ProxyServer {
    listener: TcpListener,
    rules: SharedRules,
    options: SessionOptions,
    metrics: Metrics,
}

impl ProxyServer {
    pub async fn bind(
        addr: &str,
        rules: SharedRules,
        options: SessionOptions,
        metrics: Metrics,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            rules,
            options,
            metrics,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves. Each connection gets its
    /// own session task; sessions still running at shutdown are left to finish.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("l7proxify listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("set_nodelay failed for {}: {}", peer, e);
                        }
                        let session = ProxySession::new(
                            stream,
                            peer,
                            self.rules.clone(),
                            self.options.clone(),
                            self.metrics.clone(),
                        );
                        debug!(
                            session = session.id(),
                            %peer,
                            active = self.metrics.sessions_active(),
                            "accepted"
                        );
                        tokio::spawn(session.run());
                    }
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning.
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutting down, no longer accepting connections");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{RuleEngine, RuleSpec, RuleSpecs};
    use l7proxify_shared::handshake::{ClientHello, ServerHello};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn rules(pattern: &str, action: &str) -> SharedRules {
        let specs = RuleSpecs(vec![(
            "r1".to_string(),
            RuleSpec {
                pattern: pattern.into(),
                action: action.into(),
                enabled: true,
            },
        )]);
        SharedRules::new(RuleEngine::load(&specs).unwrap())
    }

    fn hello_record(name: &str) -> Vec<u8> {
        let msg = ClientHello {
            version: 0x0303,
            cipher_suites: vec![0x1301],
            compression_methods: vec![0],
            server_name: Some(name.into()),
            ..Default::default()
        }
        .encode()
        .unwrap();
        let mut out = vec![22, 3, 1];
        out.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        out.extend_from_slice(&msg);
        out
    }

    #[tokio::test]
    async fn test_denied_connection_closed() {
        let metrics = Metrics::new();
        let server = ProxyServer::bind(
            "127.0.0.1:0",
            rules(".*", "deny"),
            SessionOptions::default(),
            metrics.clone(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_until(async move {
            let _ = stop_rx.await;
        }));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&hello_record("example.com")).await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(metrics.to_prometheus().await.contains("l7proxify_sessions_total 1"));
    }

    #[tokio::test]
    async fn test_end_to_end_over_tcp() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let options = SessionOptions {
            backend_port: backend.local_addr().unwrap().port(),
            ..Default::default()
        };
        let server = ProxyServer::bind(
            "127.0.0.1:0",
            rules("^localhost$", "allow"),
            options,
            Metrics::new(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_until(async move {
            let _ = stop_rx.await;
        }));

        let hello = hello_record("localhost");
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&hello).await.unwrap();

        let (mut upstream, _) = backend.accept().await.unwrap();
        let mut got = vec![0u8; hello.len()];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(got, hello);

        let sh = ServerHello {
            version: 0x0303,
            cipher_suite: 0x1301,
            ..Default::default()
        }
        .encode()
        .unwrap();
        let mut reply = vec![22, 3, 3];
        reply.extend_from_slice(&(sh.len() as u16).to_be_bytes());
        reply.extend_from_slice(&sh);
        upstream.write_all(&reply).await.unwrap();
        upstream.write_all(b"pong").await.unwrap();

        let mut got = vec![0u8; reply.len() + 4];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got[reply.len()..], b"pong");

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        // The session outlives the accept loop.
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
