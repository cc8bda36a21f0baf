//! Transport setup: the gRPC server on its Unix socket and the debug server
//! on loopback TCP. Both stop when the shared shutdown token is cancelled.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UnixListener};
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::protocol::v1beta1::key_management_service_server::KeyManagementServiceServer;

use super::router;
use super::service::KmsService;
use super::state::{PluginState, ServerPhase};

/// Remove whatever a previous process left at `path` and bind a fresh socket.
///
/// # Errors
///
/// Fails if the stale file cannot be removed or the socket cannot be bound.
pub fn bind_socket(path: &Path) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))
        }
    }
    UnixListener::bind(path).with_context(|| format!("failed to bind {}", path.display()))
}

/// Serve the KMS gRPC service on `listener` until `shutdown` fires, then
/// stop accepting connections and let in-flight calls finish.
///
/// With a `drain_timeout`, calls still running that long after shutdown are
/// abandoned.
///
/// # Errors
///
/// Returns an error if the transport fails.
pub async fn serve_grpc(
    listener: UnixListener,
    state: PluginState,
    shutdown: CancellationToken,
    drain_timeout: Option<Duration>,
) -> Result<()> {
    let service = KeyManagementServiceServer::new(KmsService::new(state.clone()));
    let drain_state = state.clone();
    let signal = shutdown.clone();

    state.advance(ServerPhase::Serving);
    let server = tonic::transport::Server::builder()
        .add_service(service)
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
            signal.cancelled().await;
            drain_state.advance(ServerPhase::Draining);
            info!("draining in-flight requests");
        });

    match drain_timeout {
        None => server.await.context("gRPC server failed")?,
        Some(limit) => {
            tokio::select! {
                res = server => res.context("gRPC server failed")?,
                _ = async {
                    shutdown.cancelled().await;
                    tokio::time::sleep(limit).await;
                } => warn!(timeout = ?limit, "drain timed out; abandoning in-flight requests"),
            }
        }
    }

    info!("gRPC server stopped");
    Ok(())
}

/// Bind the debug endpoint's TCP listener.
///
/// # Errors
///
/// Fails if `addr` is in use or not bindable.
pub async fn bind_debug(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind debug endpoint {addr}"))?;
    info!(addr = %addr, "debug endpoint listening");
    Ok(listener)
}

/// Serve the debug router on `listener` until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve_debug(
    listener: TcpListener,
    state: PluginState,
    shutdown: CancellationToken,
) -> Result<()> {
    axum::serve(listener, router::build(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("debug server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use hyper_util::rt::TokioIo;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;
    use tonic::transport::{Channel, Endpoint, Uri};
    use tower::service_fn;

    use common::protocol::v1beta1::key_management_service_client::KeyManagementServiceClient;
    use common::protocol::{EncryptRequest, VersionRequest};

    use crate::testing::{envelope_for, test_envelope, FakeCloud, FakeKeyStore};

    async fn connect(path: PathBuf) -> Result<KeyManagementServiceClient<Channel>, tonic::transport::Error> {
        let channel = Endpoint::try_from("http://[::]:50051")?
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move { Ok::<_, io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
            }))
            .await?;
        Ok(KeyManagementServiceClient::new(channel))
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kms.socket");
        std::fs::write(&path, b"stale").unwrap();

        let _listener = bind_socket(&path).unwrap();

        assert!(UnixStream::connect(&path).await.is_ok());
    }

    #[tokio::test]
    async fn bind_fails_in_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(bind_socket(&dir.path().join("absent/kms.socket")).is_err());
    }

    #[tokio::test]
    async fn bind_debug_fails_when_port_is_taken() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = bind_debug(addr).await.unwrap_err();
        assert!(err.to_string().contains("failed to bind debug endpoint"));
    }

    #[tokio::test]
    async fn debug_endpoint_serves_health_until_shutdown() {
        let listener = bind_debug("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = PluginState::new(test_envelope());
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_debug(listener, state, shutdown.clone()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 503"), "unexpected response: {raw}");

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn version_is_served_with_unreachable_key_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kms.socket");
        let cloud = FakeCloud::with_store(FakeKeyStore::unreachable());
        let state = PluginState::new(envelope_for(&cloud, None));
        let shutdown = CancellationToken::new();

        let listener = bind_socket(&path).unwrap();
        let server = tokio::spawn(serve_grpc(listener, state.clone(), shutdown.clone(), None));

        let mut client = connect(path).await.unwrap();
        let resp = client
            .version(VersionRequest {
                version: "v1beta1".into(),
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.version, "v1beta1");
        assert_eq!(resp.runtime_name, "Microsoft AzureKMS");
        drop(client);

        shutdown.cancel();
        server.await.unwrap().unwrap();
        assert_eq!(cloud.store.get_calls(), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_call_and_refuses_new_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kms.socket");
        let cloud = FakeCloud::with_store(FakeKeyStore::with_latency(Duration::from_secs(1)));
        cloud.store.insert_key("k8s", "v1");
        let state = PluginState::new(envelope_for(&cloud, None));
        let shutdown = CancellationToken::new();

        let listener = bind_socket(&path).unwrap();
        let server = tokio::spawn(serve_grpc(listener, state.clone(), shutdown.clone(), None));

        let mut client = connect(path.clone()).await.unwrap();
        let in_flight = tokio::spawn(async move {
            client
                .encrypt(EncryptRequest {
                    version: "v1beta1".into(),
                    plain: b"dek".to_vec(),
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        // While the first call is still running, a new one must not be served.
        let late_served = match connect(path.clone()).await {
            Err(_) => false,
            Ok(mut late) => {
                let call = late.encrypt(EncryptRequest {
                    version: "v1beta1".into(),
                    plain: b"late".to_vec(),
                });
                matches!(tokio::time::timeout(Duration::from_millis(200), call).await, Ok(Ok(_)))
            }
        };
        assert!(!late_served);
        assert!(!in_flight.is_finished());
        assert_eq!(state.phase(), ServerPhase::Draining);

        let resp = in_flight.await.unwrap().unwrap().into_inner();
        assert_eq!(resp.cipher, b"k8s/v1/ZGVr".to_vec());

        server.await.unwrap().unwrap();
        assert_eq!(state.phase(), ServerPhase::Draining);
        assert!(UnixStream::connect(&path).await.is_err());
    }
}
