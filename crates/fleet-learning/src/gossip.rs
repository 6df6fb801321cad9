//! Gossip fetcher: one known-nodes request to one teacher.

use std::sync::Arc;
use std::time::Duration;

use fleet_metadata::{PeerId, PeerRecord};
use tracing::{trace, warn};

use crate::collaborators::{CertificateStore, GossipResponse, GossipTransport, Peer};
use crate::error::{CertificateStoreError, FetchError, TransportError};
use crate::registry::FleetChecksum;

/// What one teacher told us.
#[derive(Debug, Clone)]
pub struct GossipBatch {
    pub teacher: PeerId,
    /// The teacher's fleet checksum, when reported.
    pub checksum: Option<FleetChecksum>,
    /// Encoded records, undecoded.
    pub nodes: Vec<Vec<u8>>,
    /// The teacher's view equals ours; `nodes` is empty.
    pub unchanged: bool,
}

/// Pulls peer lists from teachers through a [`GossipTransport`].
pub struct GossipFetcher {
    transport: Arc<dyn GossipTransport>,
    certificates: Arc<dyn CertificateStore>,
    timeout: Duration,
}

impl GossipFetcher {
    pub fn new(
        transport: Arc<dyn GossipTransport>,
        certificates: Arc<dyn CertificateStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            certificates,
            timeout,
        }
    }

    /// Ask `teacher` for its known nodes, sending our checksum along.
    pub async fn fetch_peer_list(
        &self,
        teacher: &PeerRecord,
        our_checksum: FleetChecksum,
    ) -> Result<GossipBatch, FetchError> {
        let id = teacher.id();
        let peer = Peer::materialize(teacher).map_err(|e| FetchError::TeacherUnreachable {
            teacher: id,
            reason: e.to_string(),
        })?;

        let certificate = match self.certificates.get(&id) {
            Ok(certificate) => certificate,
            Err(CertificateStoreError::NotFound(_)) => teacher.certificate().clone(),
            Err(err) => {
                warn!(teacher = %id, error = %err, "certificate lookup failed, using declared certificate");
                teacher.certificate().clone()
            }
        };

        let response = tokio::time::timeout(
            self.timeout,
            self.transport.known_nodes(&peer, &certificate, &our_checksum),
        )
        .await
        .map_err(|_| FetchError::TeacherUnreachable {
            teacher: id,
            reason: TransportError::Timeout.to_string(),
        })?
        .map_err(|err| match err {
            TransportError::Malformed(reason) => FetchError::MalformedResponse { teacher: id, reason },
            other => FetchError::TeacherUnreachable {
                teacher: id,
                reason: other.to_string(),
            },
        })?;

        let batch = match response {
            GossipResponse::Unchanged => GossipBatch {
                teacher: id,
                checksum: Some(our_checksum),
                nodes: Vec::new(),
                unchanged: true,
            },
            GossipResponse::Nodes { checksum, nodes } => GossipBatch {
                teacher: id,
                checksum,
                nodes,
                unchanged: false,
            },
        };
        trace!(teacher = %id, nodes = batch.nodes.len(), unchanged = batch.unchanged, "fetched peer list");
        Ok(batch)
    }
}

impl std::fmt::Debug for GossipFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipFetcher")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MemoryCertificateStore;
    use crate::testing::{signed_record, FakeGossip};
    use fleet_metadata::codec;

    fn fetcher(gossip: Arc<FakeGossip>) -> GossipFetcher {
        GossipFetcher::new(
            gossip,
            Arc::new(MemoryCertificateStore::new()),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn returns_raw_blobs() {
        let gossip = Arc::new(FakeGossip::new());
        let teacher = signed_record(1, 1);
        let blobs = vec![codec::encode(&signed_record(2, 1)), vec![0xFF]];
        gossip.teach(teacher.id(), blobs.clone());

        let batch = fetcher(gossip.clone())
            .fetch_peer_list(&teacher, FleetChecksum::empty())
            .await
            .unwrap();
        assert_eq!(batch.teacher, teacher.id());
        assert_eq!(batch.nodes, blobs);
        assert!(!batch.unchanged);
        assert_eq!(gossip.calls(), 1);
    }

    #[tokio::test]
    async fn matching_checksum_is_unchanged() {
        let gossip = Arc::new(FakeGossip::new());
        let teacher = signed_record(1, 1);
        let student = signed_record(2, 1);
        gossip.teach(teacher.id(), vec![codec::encode(&student)]);

        let mut ids = vec![teacher.id(), student.id()];
        ids.sort();
        let batch = fetcher(gossip)
            .fetch_peer_list(&teacher, FleetChecksum::of(&ids))
            .await
            .unwrap();
        assert!(batch.unchanged);
        assert!(batch.nodes.is_empty());
    }

    #[tokio::test]
    async fn transport_failures_map_to_fetch_errors() {
        let gossip = Arc::new(FakeGossip::new());
        let silent = signed_record(1, 1);
        let garbled = signed_record(2, 1);
        gossip.fail(garbled.id(), TransportError::Malformed("not json".into()));

        let fetcher = fetcher(gossip);
        let err = fetcher
            .fetch_peer_list(&silent, FleetChecksum::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TeacherUnreachable { .. }));
        assert_eq!(err.teacher(), silent.id());

        let err = fetcher
            .fetch_peer_list(&garbled, FleetChecksum::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse { .. }));
    }
}
