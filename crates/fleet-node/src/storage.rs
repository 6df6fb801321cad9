//! Persistent storage using RocksDB.

use std::path::Path;

use ed25519_dalek::SigningKey;
use fleet_learning::{CertificateStore, CertificateStoreError};
use fleet_metadata::{Certificate, PeerId};
use rocksdb::{Options, DB};

use crate::error::{Error, Result};

const NODE_KEY: &[u8] = b"node:signing_key";

/// Storage backend for node data.
pub struct Storage {
    db: DB,
}

impl Storage {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    /// Get or create the node's signing key.
    pub fn get_or_create_node_key(&self) -> Result<SigningKey> {
        if let Some(data) = self.db.get(NODE_KEY)? {
            let bytes: [u8; 32] = data
                .as_slice()
                .try_into()
                .map_err(|_| Error::Storage("Invalid stored key".into()))?;
            Ok(SigningKey::from_bytes(&bytes))
        } else {
            let mut rng = rand::thread_rng();
            let signing_key = SigningKey::generate(&mut rng);
            self.db.put(NODE_KEY, signing_key.as_bytes())?;
            Ok(signing_key)
        }
    }

    // --- Certificates ---

    fn certificate_key(peer: &PeerId) -> String {
        format!("cert:{}", peer.to_hex())
    }

    /// Store the certificate a peer proved control of.
    pub fn put_certificate(&self, peer: &PeerId, certificate: &Certificate) -> Result<()> {
        self.db
            .put(Self::certificate_key(peer).as_bytes(), certificate.as_bytes())?;
        Ok(())
    }

    /// Get a peer's stored certificate.
    pub fn get_certificate(&self, peer: &PeerId) -> Result<Option<Certificate>> {
        Ok(self
            .db
            .get(Self::certificate_key(peer).as_bytes())?
            .map(Certificate::new))
    }

    /// Count stored certificates.
    pub fn certificate_count(&self) -> Result<usize> {
        let prefix = b"cert:";
        let mut count = 0;
        for item in self.db.prefix_iterator(prefix) {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    // --- Rekey material ---

    fn rekey_key(key: &[u8]) -> String {
        format!("rekey:{}", hex::encode(key))
    }

    pub fn put_rekey(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(Self::rekey_key(key).as_bytes(), value)?;
        Ok(())
    }

    pub fn get_rekey(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(Self::rekey_key(key).as_bytes())?)
    }

    pub fn delete_rekey(&self, key: &[u8]) -> Result<()> {
        self.db.delete(Self::rekey_key(key).as_bytes())?;
        Ok(())
    }
}

impl CertificateStore for Storage {
    fn get(&self, peer: &PeerId) -> std::result::Result<Certificate, CertificateStoreError> {
        match self.get_certificate(peer) {
            Ok(Some(certificate)) => Ok(certificate),
            Ok(None) => Err(CertificateStoreError::NotFound(*peer)),
            Err(e) => Err(CertificateStoreError::Backend(e.to_string())),
        }
    }

    fn put(
        &self,
        peer: &PeerId,
        certificate: &Certificate,
    ) -> std::result::Result<(), CertificateStoreError> {
        self.put_certificate(peer, certificate)
            .map_err(|e| CertificateStoreError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn node_key_survives_reopen() {
        let dir = tempdir().unwrap();
        let first = Storage::open(dir.path()).unwrap().get_or_create_node_key().unwrap();
        let second = Storage::open(dir.path()).unwrap().get_or_create_node_key().unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn certificate_store_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let peer = PeerId::from_bytes([7u8; 32]);

        assert_eq!(
            CertificateStore::get(&storage, &peer),
            Err(CertificateStoreError::NotFound(peer))
        );
        let certificate = Certificate::new(vec![1, 2, 3]);
        CertificateStore::put(&storage, &peer, &certificate).unwrap();
        assert_eq!(CertificateStore::get(&storage, &peer).unwrap(), certificate);
        assert_eq!(storage.certificate_count().unwrap(), 1);
    }

    #[test]
    fn rekey_get_put_delete() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        assert_eq!(storage.get_rekey(b"alice-bob").unwrap(), None);
        storage.put_rekey(b"alice-bob", b"kfrag").unwrap();
        assert_eq!(storage.get_rekey(b"alice-bob").unwrap(), Some(b"kfrag".to_vec()));
        storage.delete_rekey(b"alice-bob").unwrap();
        assert_eq!(storage.get_rekey(b"alice-bob").unwrap(), None);
        // Rekeys never count as certificates.
        assert_eq!(storage.certificate_count().unwrap(), 0);
    }
}
