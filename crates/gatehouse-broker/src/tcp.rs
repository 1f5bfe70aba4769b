//! Raw TCP bridge driver.
//!
//! The reference driver: bridges a live session to a plain TCP endpoint
//! (serial-console servers, debug ports, line-based daemons). No
//! authentication of its own — if the connection references a vault
//! identity the secret is ignored here, because raw TCP has no credential
//! exchange to feed it into.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use gatehouse_storage::models::Connection;

use crate::driver::{
    Capabilities, Descriptor, Driver, DriverError, DriverInput, SessionHandle, SessionRequest,
};

const READ_BUF: usize = 8 * 1024;

/// Bridges sessions to raw TCP endpoints.
pub struct TcpBridgeDriver {
    connect_timeout: Duration,
}

impl TcpBridgeDriver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }

    async fn connect(&self, connection: &Connection) -> Result<TcpStream, DriverError> {
        let addr = format!("{}:{}", connection.host, connection.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| DriverError::Connect {
                reason: format!("timed out connecting to {addr}"),
            })?
            .map_err(|e| DriverError::Connect {
                reason: format!("{addr}: {e}"),
            })?;
        Ok(stream)
    }
}

impl Default for TcpBridgeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Driver for TcpBridgeDriver {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            id: "tcp".to_owned(),
            module: "tcp".to_owned(),
            title: "Raw TCP".to_owned(),
            category: "terminal".to_owned(),
            icon: "terminal".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            sort_order: 50,
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            terminal: true,
            recording: true,
            ..Capabilities::default()
        }
    }

    async fn validate_config(&self, settings: &serde_json::Value) -> Result<(), DriverError> {
        if settings.is_null() {
            return Ok(());
        }
        let object = settings.as_object().ok_or_else(|| DriverError::Config {
            reason: "settings must be an object".to_owned(),
        })?;
        for key in object.keys() {
            if key != "connect_timeout_secs" {
                return Err(DriverError::Config {
                    reason: format!("unknown setting '{key}'"),
                });
            }
        }
        Ok(())
    }

    async fn test_connection(&self, connection: &Connection) -> Result<(), DriverError> {
        let stream = self.connect(connection).await?;
        drop(stream);
        Ok(())
    }

    async fn launch(&self, request: SessionRequest) -> Result<SessionHandle, DriverError> {
        let stream = self.connect(&request.connection).await?;
        let (mut reader, mut writer) = stream.into_split();

        let (input_tx, mut input_rx) = tokio::sync::mpsc::channel::<DriverInput>(64);
        let (output_tx, output_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(64);

        // Writer: session input → socket. Resize is meaningless on raw TCP.
        tokio::spawn(async move {
            while let Some(event) = input_rx.recv().await {
                match event {
                    DriverInput::Data(data) => {
                        if writer.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    DriverInput::Resize { .. } => {}
                }
            }
            let _ = writer.shutdown().await;
        });

        // Reader: socket → session output. Dropping output_tx on EOF tells
        // the broker the remote hung up.
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "tcp bridge read ended");
                        break;
                    }
                }
            }
        });

        Ok(SessionHandle {
            input: input_tx,
            output: output_rx,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn connection_to(port: u16) -> Connection {
        Connection {
            id: Uuid::new_v4(),
            name: "test".to_owned(),
            protocol_id: "tcp".to_owned(),
            host: "127.0.0.1".to_owned(),
            port: i32::from(port),
            transport: "tcp".to_owned(),
            default_identity_id: None,
            team_id: None,
            settings: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    async fn echo_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn bridges_bytes_both_ways() {
        let (listener, port) = echo_listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                socket.write_all(&buf[..n]).await.unwrap();
            }
        });

        let driver = TcpBridgeDriver::new();
        let mut handle = driver
            .launch(SessionRequest {
                connection: connection_to(port),
                secret: None,
                initial_size: None,
            })
            .await
            .unwrap();

        handle
            .input
            .send(DriverInput::Data(b"marco".to_vec()))
            .await
            .unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(1), handle.output.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, b"marco");
    }

    #[tokio::test]
    async fn remote_eof_closes_output() {
        let (listener, port) = echo_listener().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let driver = TcpBridgeDriver::new();
        let mut handle = driver
            .launch(SessionRequest {
                connection: connection_to(port),
                secret: None,
                initial_size: None,
            })
            .await
            .unwrap();

        let end = tokio::time::timeout(Duration::from_secs(1), handle.output.recv())
            .await
            .unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn connect_refused_is_a_connect_error() {
        let driver = TcpBridgeDriver::new();
        // Bind-then-drop to find a port nothing listens on.
        let (listener, port) = echo_listener().await;
        drop(listener);

        let err = driver
            .launch(SessionRequest {
                connection: connection_to(port),
                secret: None,
                initial_size: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_connection_facet_works() {
        let (listener, port) = echo_listener().await;
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let driver = TcpBridgeDriver::new();
        driver.test_connection(&connection_to(port)).await.unwrap();
    }

    #[tokio::test]
    async fn validate_config_rejects_unknown_keys() {
        let driver = TcpBridgeDriver::new();
        driver
            .validate_config(&serde_json::json!({ "connect_timeout_secs": 5 }))
            .await
            .unwrap();
        assert!(matches!(
            driver
                .validate_config(&serde_json::json!({ "bogus": true }))
                .await,
            Err(DriverError::Config { .. })
        ));
    }
}
