//! How nodes and clients reach each other.
//!
//! [`ClusterTransport`] is the only thing the node and the SDK know about the
//! network: hand it a peer id and a [`Request`], get a [`Response`] or a
//! [`TransportError`]. Two implementations exist:
//!
//! - [`TcpTransport`] dials the peer id as a socket address and exchanges one
//!   length-prefixed bincode frame each way
//! - [`MemoryNetwork`] routes calls to in-process handlers and can isolate
//!   nodes, which the cluster tests use to simulate partitions

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::TransportError;
use crate::rpc::{Request, Response};

/// Frames above this size are rejected as corrupt.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Deadline applied by [`ClusterTransport::call`].
    fn rpc_timeout(&self) -> Duration;

    async fn call_with_timeout(
        &self,
        peer: &str,
        request: Request,
        deadline: Duration,
    ) -> Result<Response, TransportError>;

    async fn call(&self, peer: &str, request: Request) -> Result<Response, TransportError> {
        self.call_with_timeout(peer, request, self.rpc_timeout()).await
    }
}

/// Anything that can answer a [`Request`]; implemented by the node.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// Reads one `[len: u32 BE][bincode payload]` frame. `None` on clean EOF.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let message = bincode::deserialize(&payload).map_err(to_io_error)?;
    Ok(Some(message))
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message).map_err(to_io_error)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// One TCP connection per call; the peer id is the socket address.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(peer: &str, request: &Request) -> Result<Response, TransportError> {
        let mut stream = TcpStream::connect(peer)
            .await
            .map_err(|_| TransportError::Unreachable(peer.to_string()))?;
        write_frame(&mut stream, request)
            .await
            .map_err(|err| TransportError::Codec(err.to_string()))?;
        match read_frame(&mut stream).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(TransportError::Unreachable(peer.to_string())),
            Err(err) => Err(TransportError::Codec(err.to_string())),
        }
    }
}

#[async_trait]
impl ClusterTransport for TcpTransport {
    fn rpc_timeout(&self) -> Duration {
        self.timeout
    }

    async fn call_with_timeout(
        &self,
        peer: &str,
        request: Request,
        deadline: Duration,
    ) -> Result<Response, TransportError> {
        timeout(deadline, Self::exchange(peer, &request))
            .await
            .map_err(|_| TransportError::Timeout(peer.to_string()))?
    }
}

#[derive(Default)]
struct NetworkState {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
    isolated: HashSet<String>,
}

/// In-process network with partition control.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str, handler: Arc<dyn RpcHandler>) {
        self.state.lock().handlers.insert(id.to_string(), handler);
    }

    pub fn unregister(&self, id: &str) {
        self.state.lock().handlers.remove(id);
    }

    /// Cuts `id` off from every other member and from clients.
    pub fn isolate(&self, id: &str) {
        self.state.lock().isolated.insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.state.lock().isolated.remove(id);
    }

    pub fn heal_all(&self) {
        self.state.lock().isolated.clear();
    }

    /// Transport used by node `local`; calls fail while either side is isolated.
    pub fn transport(&self, local: &str, timeout: Duration) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: Some(local.to_string()),
            timeout,
        }
    }

    /// Transport for a client that sits outside every partition.
    pub fn client_transport(&self, timeout: Duration) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: None,
            timeout,
        }
    }

    fn route(&self, local: Option<&str>, peer: &str) -> Option<Arc<dyn RpcHandler>> {
        let state = self.state.lock();
        if state.isolated.contains(peer) {
            return None;
        }
        if local.is_some_and(|local| state.isolated.contains(local)) {
            return None;
        }
        state.handlers.get(peer).cloned()
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: Option<String>,
    timeout: Duration,
}

#[async_trait]
impl ClusterTransport for MemoryTransport {
    fn rpc_timeout(&self) -> Duration {
        self.timeout
    }

    async fn call_with_timeout(
        &self,
        peer: &str,
        request: Request,
        deadline: Duration,
    ) -> Result<Response, TransportError> {
        let handler = self
            .network
            .route(self.local.as_deref(), peer)
            .ok_or_else(|| TransportError::Unreachable(peer.to_string()))?;
        let response = timeout(deadline, handler.handle(request))
            .await
            .map_err(|_| TransportError::Timeout(peer.to_string()))?;
        // A partition that formed while the call was in flight drops the reply.
        if self.network.route(self.local.as_deref(), peer).is_none() {
            return Err(TransportError::Unreachable(peer.to_string()));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Ack, CleanBinlogRequest};

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, request: Request) -> Response {
            Response::CleanBinlog(Ack::redirect(Some(request.name().to_string())))
        }
    }

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        let response = Response::Put(Ack::redirect(Some("n2".into())));
        write_frame(&mut writer, &response).await.unwrap();
        drop(writer);

        let parsed: Response = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(parsed.ack(), Some(&Ack::redirect(Some("n2".into()))));
        let eof: Option<Response> = read_frame(&mut reader).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let parsed: io::Result<Option<Response>> = read_frame(&mut reader).await;
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn isolation_blocks_both_directions() {
        let network = MemoryNetwork::new();
        network.register("a", Arc::new(Echo));
        network.register("b", Arc::new(Echo));
        let from_a = network.transport("a", Duration::from_secs(1));
        let client = network.client_transport(Duration::from_secs(1));

        assert!(from_a.call("b", Request::ShowStatus).await.is_ok());

        network.isolate("a");
        assert_eq!(
            from_a.call("b", Request::ShowStatus).await.unwrap_err(),
            TransportError::Unreachable("b".into())
        );
        assert!(client.call("a", Request::ShowStatus).await.is_err());
        assert!(client.call("b", Request::ShowStatus).await.is_ok());

        network.heal("a");
        let response = from_a
            .call("b", Request::CleanBinlog(CleanBinlogRequest { end_index: 0 }))
            .await
            .unwrap();
        assert_eq!(response.ack(), Some(&Ack::redirect(Some("CleanBinlog".into()))));
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let network = MemoryNetwork::new();
        let client = network.client_transport(Duration::from_secs(1));
        assert!(matches!(
            client.call("ghost", Request::ShowStatus).await,
            Err(TransportError::Unreachable(_))
        ));
    }
}
