//! Authentication for Coffer
//!
//! AWS Signature Version 4 verification for header-signed, presigned and
//! aws-chunked streaming requests, plus the credential lookup capability.

pub mod chunked;
pub mod credentials;
pub mod presigned;
pub mod signature;
pub mod verifier;

pub use chunked::ChunkSigner;
pub use credentials::{generate_credentials, CredentialProvider, StaticCredentialProvider};
pub use presigned::{generate_presigned_url, is_presigned_request, PresignRequest};
pub use signature::{SignatureV4, SigningScope};
pub use verifier::{AuthOutcome, AuthPolicy, AuthRequest, PayloadMode, SignatureVerifier};
