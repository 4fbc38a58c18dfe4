//! Host identity provisioning.
//!
//! A server runs with exactly one host key. It is either read from a
//! file the operator supplies, or generated at startup and kept in
//! memory only. Nothing in this module ever writes a key to disk.

use std::path::{Path, PathBuf};

use rand_core::OsRng;
use russh::keys::{decode_secret_key, Algorithm, HashAlg, PrivateKey};
use tracing::{info, warn};

use crate::Error;

/// Where a [HostIdentity] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    /// Loaded from a key file that outlives the process.
    Persistent(PathBuf),
    /// Generated at startup, gone when the process exits.
    Ephemeral,
}

/// The server's signing key pair. Immutable once created.
#[derive(Debug)]
pub struct HostIdentity {
    key: PrivateKey,
    provenance: Provenance,
}

impl HostIdentity {
    /// Load the key at `path` if one is given, otherwise generate a
    /// temporary Ed25519 key.
    pub fn provision(path: Option<&Path>) -> Result<Self, Error> {
        match path {
            Some(path) => Self::load(path),
            None => Self::generate(),
        }
    }

    /// Read and decode a private key file (OpenSSH, PKCS#8 or PKCS#1 PEM).
    pub fn load(path: &Path) -> Result<Self, Error> {
        let bytes = std::fs::read(path).map_err(|source| Error::KeyRead {
            path: path.to_path_buf(),
            source,
        })?;
        let key = Self::decode(path, &bytes)?;
        info!(
            path = %path.display(),
            sha256_fingerprint = %key.public_key().fingerprint(HashAlg::Sha256),
            "Loaded host key"
        );
        Ok(HostIdentity {
            key,
            provenance: Provenance::Persistent(path.to_path_buf()),
        })
    }

    /// Generate a fresh Ed25519 key from the OS random source.
    pub fn generate() -> Result<Self, Error> {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(Error::KeyGen)?;
        warn!(
            sha256_fingerprint = %key.public_key().fingerprint(HashAlg::Sha256),
            "Using a temporary host key, consider creating a permanent one and passing it to -host_key"
        );
        Ok(HostIdentity {
            key,
            provenance: Provenance::Ephemeral,
        })
    }

    fn decode(path: &Path, bytes: &[u8]) -> Result<PrivateKey, Error> {
        let parse_error = |source| Error::KeyParse {
            path: path.to_path_buf(),
            source,
        };
        let text = std::str::from_utf8(bytes)
            .map_err(|_| parse_error(russh::keys::Error::CouldNotReadKey))?;
        decode_secret_key(text, None).map_err(parse_error)
    }

    pub fn key(&self) -> &PrivateKey {
        &self.key
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn is_ephemeral(&self) -> bool {
        self.provenance == Provenance::Ephemeral
    }

    /// `SHA256:<base64>` fingerprint of the public half.
    pub fn fingerprint(&self) -> String {
        self.key.public_key().fingerprint(HashAlg::Sha256).to_string()
    }
}
