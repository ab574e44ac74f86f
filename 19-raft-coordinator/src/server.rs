use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{debug, info, warn};

use crate::rpc::Request;
use crate::transport::{RpcHandler, read_frame, write_frame};

/// Accept loop that feeds framed requests to an [`RpcHandler`].
pub struct RpcServer {
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
}

impl RpcServer {
    pub fn new(listener: TcpListener, handler: Arc<dyn RpcHandler>) -> Self {
        Self { listener, handler }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RpcServer { listener, handler } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("rpc server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &handler);
                }
            }
        }

        Ok(())
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    handler: &Arc<dyn RpcHandler>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, handler),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, handler: &Arc<dyn RpcHandler>) {
    let handler = Arc::clone(handler);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, handler).await {
            debug!(peer = %peer, error = ?err, "rpc connection closed with error");
        }
    });
}

/// Serves requests on one connection until the caller hangs up.
async fn handle_connection(mut stream: TcpStream, handler: Arc<dyn RpcHandler>) -> Result<()> {
    while let Some(request) = read_frame::<_, Request>(&mut stream).await? {
        let response = handler.handle(request).await;
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}
