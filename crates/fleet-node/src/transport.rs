//! Line-delimited JSON gossip over TCP.
//!
//! Each connection carries newline-terminated JSON requests, answered in
//! order with one JSON line each. Two requests exist:
//!
//! - `known_nodes`: the teacher's shareable peers as hex-encoded metadata,
//!   or `unchanged` when the caller's fleet checksum equals the teacher's.
//! - `identify`: a signature over a caller-chosen nonce and the node's
//!   certificate, proving control of the endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_learning::{
    FleetChecksum, GossipResponse, GossipTransport, Learner, NetworkVerifier, Peer,
    TransportError, VerificationError,
};
use fleet_metadata::{codec, Certificate, NodeIdentity, PeerId, PeerRecord, TrustLevel};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Longest request line a server reads.
pub const MAX_REQUEST_LEN: u64 = 64 * 1024;

/// Longest response line a client reads.
pub const MAX_RESPONSE_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    KnownNodes { checksum: String },
    Identify { nonce: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Nodes { checksum: String, nodes: Vec<String> },
    Unchanged,
    Identity { certificate: String, signature: String },
    Error { message: String },
}

/// Client side: gossip requests and identify challenges.
#[derive(Debug, Clone)]
pub struct TcpGossipClient {
    timeout: Duration,
}

impl TcpGossipClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// One request, one response, on a fresh connection.
    async fn exchange(&self, peer: &Peer, request: &Request) -> std::result::Result<Response, TransportError> {
        match tokio::time::timeout(self.timeout, self.exchange_inner(peer, request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn exchange_inner(
        &self,
        peer: &Peer,
        request: &Request,
    ) -> std::result::Result<Response, TransportError> {
        let address = &peer.address;
        let stream = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{address}: {e}")))?;
        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_string(request)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{address}: {e}")))?;

        let mut reader = BufReader::new(reader).take(MAX_RESPONSE_LEN);
        let mut answer = String::new();
        let n = reader
            .read_line(&mut answer)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{address}: {e}")))?;
        if n == 0 {
            return Err(TransportError::ConnectionFailed(format!(
                "{address}: closed without answering"
            )));
        }
        if !answer.ends_with('\n') {
            return Err(TransportError::Malformed(format!(
                "response from {address} truncated at {n} bytes"
            )));
        }

        serde_json::from_str(&answer).map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl GossipTransport for TcpGossipClient {
    async fn known_nodes(
        &self,
        teacher: &Peer,
        _certificate: &Certificate,
        our_checksum: &FleetChecksum,
    ) -> std::result::Result<GossipResponse, TransportError> {
        let request = Request::KnownNodes {
            checksum: our_checksum.to_hex(),
        };
        match self.exchange(teacher, &request).await? {
            Response::Unchanged => Ok(GossipResponse::Unchanged),
            Response::Nodes { checksum, nodes } => Ok(GossipResponse::Nodes {
                checksum: FleetChecksum::from_hex(&checksum).ok(),
                // Undecodable entries stay in place as empty blobs and are
                // counted by the learner like any other bad record.
                nodes: nodes
                    .iter()
                    .map(|node| hex::decode(node).unwrap_or_default())
                    .collect(),
            }),
            Response::Error { message } => Err(TransportError::Malformed(message)),
            Response::Identity { .. } => Err(TransportError::Malformed(
                "identity answer to a known_nodes request".into(),
            )),
        }
    }
}

#[async_trait]
impl NetworkVerifier for TcpGossipClient {
    async fn verify(&self, peer: &Peer) -> std::result::Result<Certificate, VerificationError> {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);

        let request = Request::Identify {
            nonce: hex::encode(nonce),
        };
        let unreachable = |reason: String| VerificationError::Unreachable {
            peer: peer.id,
            reason,
        };

        let (certificate, signature) = match self.exchange(peer, &request).await {
            Ok(Response::Identity {
                certificate,
                signature,
            }) => (certificate, signature),
            Ok(other) => return Err(unreachable(format!("unexpected answer {other:?}"))),
            Err(e) => return Err(unreachable(e.to_string())),
        };

        let certificate = hex::decode(&certificate)
            .map(Certificate::new)
            .map_err(|e| unreachable(format!("bad certificate encoding: {e}")))?;
        let signature: [u8; 64] = hex::decode(&signature)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| unreachable("bad signature encoding".into()))?;

        // Whoever answers must hold the key the metadata declares.
        if !fleet_metadata::verify_challenge(
            peer.verifying_key.as_bytes(),
            &nonce,
            &certificate,
            &signature,
        ) {
            return Err(VerificationError::CertificateMismatch(peer.id));
        }
        Ok(certificate)
    }
}

/// Server side: answers gossip from the learner's registry.
pub struct GossipServer {
    learner: Arc<Learner>,
    identity: NodeIdentity,
    record: PeerRecord,
}

impl GossipServer {
    pub fn new(learner: Arc<Learner>, identity: NodeIdentity, record: PeerRecord) -> Self {
        Self {
            learner,
            identity,
            record,
        }
    }

    /// Accept connections forever, one task per connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Gossip listening on {}", listener.local_addr()?);
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Incoming gossip connection from {}", addr);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            warn!("Gossip connection error from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            let n = (&mut reader)
                .take(MAX_REQUEST_LEN)
                .read_line(&mut line)
                .await?;
            if n == 0 {
                break;
            }
            if !line.ends_with('\n') {
                let response = Response::Error {
                    message: format!("request exceeds {MAX_REQUEST_LEN} bytes"),
                };
                write_line(&mut writer, &response).await?;
                break;
            }

            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => self.answer(request),
                Err(e) => Response::Error {
                    message: format!("bad request: {e}"),
                },
            };
            write_line(&mut writer, &response).await?;
        }
        Ok(())
    }

    /// Answer one request.
    pub fn answer(&self, request: Request) -> Response {
        match request {
            Request::KnownNodes { checksum } => self.known_nodes(&checksum),
            Request::Identify { nonce } => self.identify(&nonce),
        }
    }

    fn known_nodes(&self, their_checksum: &str) -> Response {
        let local_id = self.record.id();
        let mut shared = self.learner.known().select(
            |r| r.trust_level >= TrustLevel::MetadataValid && !r.flagged && r.id() != local_id,
            usize::MAX,
        );
        shared.push(self.record.clone());
        shared.sort_by_key(PeerRecord::id);

        let ids: Vec<PeerId> = shared.iter().map(PeerRecord::id).collect();
        let ours = FleetChecksum::of(&ids);
        if FleetChecksum::from_hex(their_checksum).ok() == Some(ours) {
            return Response::Unchanged;
        }

        Response::Nodes {
            checksum: ours.to_hex(),
            nodes: shared.iter().map(codec::to_hex).collect(),
        }
    }

    fn identify(&self, nonce: &str) -> Response {
        let nonce: Option<[u8; 32]> = hex::decode(nonce).ok().and_then(|b| b.try_into().ok());
        let Some(nonce) = nonce else {
            return Response::Error {
                message: "nonce must be 32 hex-encoded bytes".into(),
            };
        };
        let certificate = self.record.certificate();
        Response::Identity {
            certificate: hex::encode(certificate.as_bytes()),
            signature: hex::encode(self.identity.answer_challenge(&nonce, certificate)),
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> Result<()> {
    let json = serde_json::to_string(response)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}
