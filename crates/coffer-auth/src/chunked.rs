//! Chunk signature chaining for `STREAMING-AWS4-HMAC-SHA256-PAYLOAD` bodies
//!
//! Every chunk signs the signature of the chunk before it; the first chunk
//! chains off the seed signature from the request headers.

use coffer_core::{Error, Result};
use coffer_crypto::{constant_time_eq, hmac_sha256_hex, sha256_hash, EMPTY_SHA256};

use crate::signature::SigningScope;

const CHUNK_ALGORITHM: &str = "AWS4-HMAC-SHA256-PAYLOAD";

#[derive(Clone)]
pub struct ChunkSigner {
    signing_key: Vec<u8>,
    amz_date: String,
    scope: String,
    previous_signature: String,
}

impl std::fmt::Debug for ChunkSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSigner")
            .field("amz_date", &self.amz_date)
            .field("scope", &self.scope)
            .field("previous_signature", &self.previous_signature)
            .finish_non_exhaustive()
    }
}

impl ChunkSigner {
    pub fn new(
        signing_key: Vec<u8>,
        amz_date: impl Into<String>,
        scope: &SigningScope,
        seed_signature: impl Into<String>,
    ) -> Self {
        Self {
            signing_key,
            amz_date: amz_date.into(),
            scope: scope.to_string(),
            previous_signature: seed_signature.into(),
        }
    }

    fn expected(&self, chunk: &[u8]) -> String {
        let sts = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            CHUNK_ALGORITHM,
            self.amz_date,
            self.scope,
            self.previous_signature,
            EMPTY_SHA256,
            sha256_hash(chunk)
        );
        hmac_sha256_hex(&self.signing_key, sts.as_bytes())
    }

    /// Check one chunk (the zero-length terminator included) and advance the chain
    pub fn verify_chunk(&mut self, chunk: &[u8], signature: &str) -> Result<()> {
        let expected = self.expected(chunk);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(Error::SignatureDoesNotMatch);
        }
        self.previous_signature = expected;
        Ok(())
    }

    /// Signature for the next chunk, as a client would compute it
    pub fn sign_chunk(&mut self, chunk: &[u8]) -> String {
        let signature = self.expected(chunk);
        self.previous_signature = signature.clone();
        signature
    }
}
