//! Node identity — the long-lived key a node is known by.
//!
//! Message signing is out of scope, so the key is only used to derive a
//! stable fingerprint for `PeerHandle`. It is generated once and stored as
//! hex at `identity.keypair_path`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::peer::PeerHandle;

/// A node's 32-byte identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeKey {
    pub public: [u8; 32],
}

impl NodeKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut public = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut public);
        Self { public }
    }

    /// Load the key from `path`, generating and writing a new one if the
    /// file does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| IdentityError::ReadFailed(path.to_path_buf(), e))?;
            let bytes = hex::decode(text.trim())
                .map_err(|_| IdentityError::Malformed(path.to_path_buf()))?;
            let public: [u8; 32] = bytes
                .try_into()
                .map_err(|_| IdentityError::Malformed(path.to_path_buf()))?;
            return Ok(Self { public });
        }

        let key = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IdentityError::WriteFailed(path.to_path_buf(), e))?;
        }
        std::fs::write(path, hex::encode(key.public))
            .map_err(|e| IdentityError::WriteFailed(path.to_path_buf(), e))?;
        Ok(key)
    }

    /// The handle other nodes use for us when we listen on `addr`.
    pub fn handle(&self, addr: SocketAddr) -> PeerHandle {
        PeerHandle::new(addr, &self.public)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("{0} does not contain a 32-byte hex key")]
    Malformed(PathBuf),
}
