//! Fleet node: the long-running process around the learning loop.
//!
//! Architecture:
//! - RocksDB storage for the node key and verified peer certificates
//! - TCP gossip server answering `known_nodes` and `identify`
//! - Background learning loop fed by teacher metadata files
//! - HTTP API for status and the known-nodes view

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleet_learning::{Learner, VerificationPipeline};
use fleet_metadata::{codec, NodeIdentity, PeerRecord};

use crate::api::{self, ApiState};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::storage::Storage;
use crate::transport::{GossipServer, TcpGossipClient};

/// Write `record` as a hex metadata file.
pub fn write_metadata_file(path: &Path, record: &PeerRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", codec::to_hex(record)))?;
    Ok(())
}

/// Read a hex metadata file written by [`write_metadata_file`].
pub fn read_metadata_file(path: &Path) -> Result<PeerRecord> {
    let contents = std::fs::read_to_string(path)?;
    Ok(codec::from_hex(contents.trim())?)
}

/// Read every teacher file. A single unreadable file fails the whole load.
pub fn load_teachers(paths: &[PathBuf]) -> Result<Vec<PeerRecord>> {
    paths
        .iter()
        .map(|path| {
            read_metadata_file(path).inspect_err(|e| {
                tracing::error!("Cannot load teacher metadata {:?}: {}", path, e);
            })
        })
        .collect()
}

/// A fleet node.
pub struct FleetNode {
    config: NodeConfig,
    identity: NodeIdentity,
    record: PeerRecord,
    storage: Arc<Storage>,
    learner: Arc<Learner>,
}

impl FleetNode {
    /// Open storage, load or create the node key and sign our metadata.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let storage = Arc::new(Storage::open(config.data_dir.join("db"))?);

        let identity = NodeIdentity::from_signing_key(storage.get_or_create_node_key()?);
        let address = config.public_address();
        let certificate = identity.self_issued_certificate(&address);
        let record = identity.sign_metadata(address, certificate, fleet_metadata::unix_millis());

        // No staking ledger: the fleet runs federated, NetworkVerified is the top level.
        let client = Arc::new(TcpGossipClient::new(config.learning.fetch_timeout));
        let known = Arc::new(fleet_learning::KnownNodes::new());
        let pipeline =
            VerificationPipeline::new(known, client.clone(), storage.clone(), &config.learning);
        let learner = Learner::new(config.learning.clone(), Arc::new(pipeline), client)
            .with_local_id(record.id());

        Ok(Self {
            config,
            identity,
            record,
            storage,
            learner: Arc::new(learner),
        })
    }

    pub fn record(&self) -> &PeerRecord {
        &self.record
    }

    pub fn learner(&self) -> &Arc<Learner> {
        &self.learner
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Run the node until ctrl-c.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Cannot listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Received ctrl-c, shutting down");
        })
        .await
    }

    /// Run the node: gossip server, learning loop and HTTP API, until
    /// `shutdown` resolves. Stops the loop and removes our metadata file on
    /// the way out.
    pub async fn run_until(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        tracing::info!("Fleet node starting");
        tracing::info!("  Peer: {}", self.record.id());
        tracing::info!("  Gossip: {}", self.config.listen_addr);
        tracing::info!("  API: http://{}", self.config.api_addr);
        tracing::info!("  Data: {:?}", self.config.data_dir);

        if self.config.save_metadata {
            let path = self.config.metadata_path();
            write_metadata_file(&path, &self.record)?;
            tracing::info!("Wrote node metadata to {:?}", path);
        }

        // Gossip first so teachers learning from us can connect right away.
        let listener = tokio::net::TcpListener::bind(self.config.listen_addr).await?;
        let server = Arc::new(GossipServer::new(
            Arc::clone(&self.learner),
            NodeIdentity::from_signing_key(self.identity.signing_key().clone()),
            self.record.clone(),
        ));
        let gossip = tokio::spawn(async move {
            if let Err(e) = server.run(listener).await {
                tracing::error!("Gossip server error: {}", e);
            }
        });

        let teachers = load_teachers(&self.config.teacher_metadata)?;
        if !teachers.is_empty() {
            let count = teachers.len();
            let verified = self.learner.bootstrap(teachers).await;
            if verified == 0 {
                tracing::warn!("None of {} teachers could be verified; retrying in the loop", count);
            }
        }
        self.learner.start()?;

        let app = api::build_router(Arc::new(ApiState {
            learner: Arc::clone(&self.learner),
            local: self.record.clone(),
        }));
        let listener = tokio::net::TcpListener::bind(self.config.api_addr).await?;
        tracing::info!("HTTP server listening on {}", self.config.api_addr);

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await;

        gossip.abort();
        let stopped = self.learner.shutdown().await;
        if self.config.save_metadata {
            remove_metadata_file(&self.config.metadata_path())?;
        }
        served?;
        stopped?;
        tracing::info!("Fleet node stopped");
        Ok(())
    }
}

fn remove_metadata_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
