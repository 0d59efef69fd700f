//! Framed JSON over TCP.
//!
//! Each frame is a length-delimited JSON document. Peer connections carry one
//! request and one reply; client connections may carry many request/response
//! pairs back to back.

use crate::error::{Error, Result};
use crate::protocol::{PeerMessage, PeerReply, RpcRequest, RpcResponse};
use crate::NodeId;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Largest frame either side will accept.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

pub type JsonFramed<S> = Framed<S, LengthDelimitedCodec>;

pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> JsonFramed<S> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec();
    Framed::new(stream, codec)
}

pub async fn write_frame<S, T>(framed: &mut JsonFramed<S>, value: &T) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = serde_json::to_vec(value)?;
    framed.send(Bytes::from(buf)).await?;
    Ok(())
}

/// Next frame, or `None` on a clean close. Undecodable frames are protocol errors.
pub async fn read_frame<S, T>(framed: &mut JsonFramed<S>) -> Result<Option<T>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    match framed.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(e.into()),
        Some(Ok(bytes)) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::Protocol(format!("undecodable frame: {e}"))),
    }
}

/// Connect, send one frame, wait for one reply frame. The whole exchange is
/// bounded by `limit`.
pub async fn request<Q, R>(addr: SocketAddr, message: &Q, limit: Duration) -> Result<R>
where
    Q: Serialize,
    R: DeserializeOwned,
{
    let exchange = async {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::transport(addr, e))?;
        stream.set_nodelay(true).ok();
        let mut framed = framed(stream);
        write_frame(&mut framed, message).await?;
        read_frame::<_, R>(&mut framed)
            .await?
            .ok_or_else(|| Error::transport(addr, "connection closed before reply"))
    };
    match timeout(limit, exchange).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout(addr.to_string())),
    }
}

/// One client RPC against a replica or the balancer.
pub async fn call(addr: SocketAddr, request: &RpcRequest, limit: Duration) -> Result<RpcResponse> {
    self::request(addr, request, limit).await
}

/// Outbound side of the peer channel.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, target: NodeId, message: PeerMessage) -> Result<PeerReply>;
}

/// Inbound side of the peer channel. Handlers answer quickly; anything that
/// fans out further (ring forwarding) runs on its own task.
#[async_trait]
pub trait PeerHandler: Send + Sync {
    async fn handle_peer(&self, message: PeerMessage) -> PeerReply;
}

/// Peer transport over real sockets.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    peers: BTreeMap<NodeId, SocketAddr>,
    call_timeout: Duration,
}

impl TcpTransport {
    pub fn new(peers: BTreeMap<NodeId, SocketAddr>, call_timeout: Duration) -> Self {
        Self { peers, call_timeout }
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn send(&self, target: NodeId, message: PeerMessage) -> Result<PeerReply> {
        let addr = *self
            .peers
            .get(&target)
            .ok_or_else(|| Error::transport(format!("node {target}"), "not in roster"))?;
        request(addr, &message, self.call_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientCall;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn request_round_trips_one_frame_each_way() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut f = framed(stream);
            let req: RpcRequest = read_frame(&mut f).await.unwrap().unwrap();
            assert_eq!(req.call, ClientCall::Ping);
            write_frame(&mut f, &RpcResponse::ok(41).with("status", "ok")).await.unwrap();
        });

        let resp = call(addr, &RpcRequest::new(ClientCall::Ping, Some(1)), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.server_clock, 41);
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = call(addr, &RpcRequest::new(ClientCall::Ping, None), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = call(addr, &RpcRequest::new(ClientCall::Ping, None), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn garbage_frame_is_a_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut f = framed(stream);
            let _ = f.next().await;
            f.send(Bytes::from_static(b"not json")).await.unwrap();
        });

        let err = call(addr, &RpcRequest::new(ClientCall::Ping, None), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
