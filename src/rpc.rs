//! # TCP RPC Transport
//!
//! Request/response plumbing for the five Kademlia RPCs over plain TCP.
//! Frames are a u32 big-endian length prefix followed by a bincode body,
//! bounded on both ends to keep hostile peers from ballooning memory.
//!
//! [`RpcServer`] owns the listener and a [`DhtNode`] handle; each accepted
//! connection is served on its own task, reading frames until the peer
//! closes or goes idle. [`RpcClient`] implements [`KademliaRpc`] by dialing
//! per call, attaching a fresh `msg_id`, and rejecting replies whose echo
//! does not match.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, trace, warn};

use crate::dht::DhtNode;
use crate::identity::{Contact, NodeId};
use crate::messages::{self, FindValueReply, RpcRequest, RpcResponse, MAX_VALUE_SIZE};
use crate::protocols::KademliaRpc;

/// Upper bound on any single frame (value limit plus framing slack).
const MAX_FRAME_SIZE: usize = MAX_VALUE_SIZE + 4096;

/// Bound on one outbound call: dial, send, await the reply.
const CALL_TIMEOUT: Duration = Duration::from_secs(8);

/// How long a served connection may sit idle between requests.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> Result<()> {
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame; `None` on clean EOF before the prefix.
async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let len = match stream.read_u32().await {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        bail!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Listener side of the RPC surface.
///
/// The server value owns the listener and the node handle; connection tasks
/// borrow clones of the handle rather than reaching for process globals.
pub struct RpcServer<N: KademliaRpc> {
    listener: TcpListener,
    node: DhtNode<N>,
}

impl<N: KademliaRpc> RpcServer<N> {
    /// Bind the listener. Fails fast if the address is unavailable.
    pub async fn bind(addr: &str, node: DhtNode<N>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind listener on {}", addr))?;
        Ok(Self { listener, node })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Runs until the process exits; each connection is served
    /// on its own task.
    pub async fn serve(self) -> Result<()> {
        loop {
            let (stream, remote) = self
                .listener
                .accept()
                .await
                .context("listener accept failed")?;
            trace!(remote = %remote, "accepted connection");
            let node = self.node.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(node, stream, remote).await {
                    debug!(remote = %remote, error = ?e, "connection error");
                }
            });
        }
    }

    /// Spawn the accept loop in the background and return the bound address.
    pub fn spawn(self) -> Result<SocketAddr> {
        let addr = self.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = self.serve().await {
                warn!(error = ?e, "rpc server terminated");
            }
        });
        Ok(addr)
    }
}

/// Serve one connection: frames in, frames out, until EOF or idle timeout.
async fn handle_connection<N: KademliaRpc>(
    node: DhtNode<N>,
    mut stream: TcpStream,
    remote: SocketAddr,
) -> Result<()> {
    loop {
        let body = match timeout(IDLE_TIMEOUT, read_frame(&mut stream)).await {
            Ok(read) => match read? {
                Some(body) => body,
                None => return Ok(()),
            },
            Err(_) => {
                trace!(remote = %remote, "closing idle connection");
                return Ok(());
            }
        };

        let request: RpcRequest = match messages::deserialize_bounded(&body) {
            Ok(req) => req,
            Err(e) => {
                debug!(remote = %remote, error = %e, "undecodable request frame");
                return Ok(());
            }
        };

        let response = node.handle_request(request).await;
        let encoded = messages::serialize(&response).context("failed to encode response")?;
        write_frame(&mut stream, &encoded).await?;
    }
}

/// Dial-per-call client side of the RPC surface.
///
/// Each call opens a fresh connection, exchanges one frame pair and drops
/// the stream, so no connection state can leak across probes.
#[derive(Clone)]
pub struct RpcClient {
    self_contact: Contact,
}

impl RpcClient {
    pub fn new(self_contact: Contact) -> Self {
        Self { self_contact }
    }

    async fn call(&self, to: &Contact, request: RpcRequest) -> Result<RpcResponse> {
        let msg_id = request.msg_id();
        let addr = to.addr();
        let response = timeout(CALL_TIMEOUT, async {
            let mut stream = TcpStream::connect(&addr)
                .await
                .with_context(|| format!("failed to dial {}", addr))?;
            let encoded = messages::serialize(&request).context("failed to encode request")?;
            write_frame(&mut stream, &encoded).await?;
            let body = read_frame(&mut stream)
                .await?
                .context("peer closed without replying")?;
            let response: RpcResponse =
                messages::deserialize_bounded(&body).context("undecodable response")?;
            Ok::<_, anyhow::Error>(response)
        })
        .await
        .map_err(|_| anyhow::anyhow!("rpc to {} timed out", addr))??;

        if response.msg_id() != msg_id {
            bail!(
                "msg id mismatch from {}: sent {}, got {}",
                addr,
                msg_id,
                response.msg_id()
            );
        }
        Ok(response)
    }
}

#[async_trait]
impl KademliaRpc for RpcClient {
    async fn ping(&self, to: &Contact) -> Result<()> {
        let request = RpcRequest::Ping {
            sender: self.self_contact.clone(),
            msg_id: NodeId::random(),
        };
        match self.call(to, request).await? {
            RpcResponse::Pong { .. } => Ok(()),
            other => bail!("unexpected response to Ping: {:?}", other),
        }
    }

    async fn store(&self, to: &Contact, key: NodeId, value: Vec<u8>) -> Result<()> {
        let request = RpcRequest::Store {
            sender: self.self_contact.clone(),
            msg_id: NodeId::random(),
            key,
            value,
        };
        match self.call(to, request).await? {
            RpcResponse::StoreResult { error: None, .. } => Ok(()),
            RpcResponse::StoreResult {
                error: Some(detail),
                ..
            } => bail!("store rejected by {}: {}", to.addr(), detail),
            other => bail!("unexpected response to Store: {:?}", other),
        }
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        let request = RpcRequest::FindNode {
            sender: self.self_contact.clone(),
            msg_id: NodeId::random(),
            target,
        };
        match self.call(to, request).await? {
            RpcResponse::FindNodeResult { nodes, .. } => Ok(nodes),
            other => bail!("unexpected response to FindNode: {:?}", other),
        }
    }

    async fn find_value(
        &self,
        to: &Contact,
        key: NodeId,
        update_timestamp: bool,
    ) -> Result<FindValueReply> {
        let request = RpcRequest::FindValue {
            sender: self.self_contact.clone(),
            msg_id: NodeId::random(),
            key,
            update_timestamp,
        };
        match self.call(to, request).await? {
            RpcResponse::FindValueResult { value, nodes, .. } => {
                Ok(FindValueReply::from_wire(value, nodes))
            }
            other => bail!("unexpected response to FindValue: {:?}", other),
        }
    }

    async fn delete(&self, to: &Contact, key: NodeId) -> Result<Vec<Contact>> {
        let request = RpcRequest::Delete {
            sender: self.self_contact.clone(),
            msg_id: NodeId::random(),
            key,
        };
        match self.call(to, request).await? {
            RpcResponse::DeleteResult { error: None, nodes, .. } => Ok(nodes),
            RpcResponse::DeleteResult {
                error: Some(detail),
                ..
            } => bail!("delete rejected by {}: {}", to.addr(), detail),
            other => bail!("unexpected response to Delete: {:?}", other),
        }
    }
}
