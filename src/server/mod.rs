//! Replica Server
//!
//! The single TCP endpoint every replica exposes. Peer RPCs and client
//! RPCs arrive over the same framed protocol; each accepted connection
//! gets its own task running a request/response loop.

pub mod protocol;

mod handler;

pub use handler::RequestHandler;
pub use protocol::{ErrorCode, Request, Response};

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::consensus::Replica;
use crate::store::EntityStore;

use protocol::{read_frame, write_frame};

/// The replica's network face.
pub struct Server {
    listen: SocketAddr,
    handler: Arc<RequestHandler>,
}

impl Server {
    /// Create a server for one replica
    pub fn new(listen: SocketAddr, replica: Arc<Replica>, store: Arc<EntityStore>) -> Self {
        Self {
            listen,
            handler: Arc::new(RequestHandler::new(replica, store)),
        }
    }

    /// Bind the listen address and serve until the task is dropped
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.listen)
            .await
            .with_context(|| format!("failed to bind {}", self.listen))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener (tests bind port 0 first)
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("replica listening on {}", self.listen);

        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!("new connection from {}", remote);
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, handler).await {
                            debug!("connection from {} ended: {}", remote, err);
                        }
                    });
                }
                Err(err) => {
                    error!("accept error: {}", err);
                }
            }
        }
    }
}

/// One request/response loop per connection. Returns on clean EOF.
async fn handle_connection(mut stream: TcpStream, handler: Arc<RequestHandler>) -> Result<()> {
    loop {
        let request: Request = match read_frame(&mut stream).await {
            Ok(request) => request,
            Err(err) => {
                if is_clean_eof(&err) {
                    return Ok(());
                }
                // A garbled frame gets one error response before we hang up.
                let response =
                    Response::error(ErrorCode::InvalidRequest, format!("bad request: {}", err));
                let _ = write_frame(&mut stream, &response).await;
                warn!("dropping connection after undecodable frame");
                return Err(err);
            }
        };

        let response = handler.handle(request).await;
        write_frame(&mut stream, &response).await?;
    }
}

fn is_clean_eof(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .map(|io| io.kind() == std::io::ErrorKind::UnexpectedEof)
        .unwrap_or(false)
}
