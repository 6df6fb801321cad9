//! Fleet node
//!
//! A long-running process that joins a fleet of peers: it keeps a persistent
//! identity, answers gossip over TCP and runs the learning loop from
//! `fleet-learning` in the background.
//!
//! # Architecture
//!
//! - **Storage**: RocksDB-backed node key and peer certificates
//! - **Transport**: line-delimited JSON gossip and identify challenges
//! - **API**: HTTP status and known-nodes endpoints
//! - **Node**: wires the above around a [`fleet_learning::Learner`]
//!
//! # Example
//!
//! ```no_run
//! use fleet_node::{FleetNode, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::from_env()?;
//!     let node = FleetNode::new(config).await?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod node;
pub mod storage;
pub mod transport;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use node::{load_teachers, read_metadata_file, write_metadata_file, FleetNode};
pub use storage::Storage;
pub use transport::{GossipServer, Request, Response, TcpGossipClient};
