//! Request body decoding
//!
//! Object data never gets buffered whole. The HTTP body is wrapped in stream
//! adapters that decode aws-chunked framing, check the declared payload digest
//! and enforce the declared length. A failed check surfaces as an error item,
//! which makes the storage backend discard whatever it already spooled.

use axum::body::Body;
use bytes::{Buf, Bytes, BytesMut};
use coffer_auth::{ChunkSigner, PayloadMode};
use coffer_core::{Error, Result};
use coffer_crypto::Sha256Hasher;
use coffer_storage::ByteStream;
use futures::{stream, TryStreamExt};
use std::collections::BTreeMap;
use tracing::debug;

/// Longest chunk header line accepted before the CRLF
const MAX_CHUNK_HEADER_LEN: usize = 4096;

/// Largest single aws-chunked chunk; SDKs send 64 KiB
const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Wrap an axum body; a transport error means the client went away
pub fn body_stream(body: Body) -> ByteStream {
    Box::pin(body.into_data_stream().map_err(|e| {
        debug!("request body aborted: {}", e);
        Error::IncompleteBody
    }))
}

/// Build the verified object data stream for an upload request.
///
/// Returns the stream together with the declared decoded length, which also
/// serves as the size hint for the backend.
pub fn upload_stream(
    body: Body,
    payload: PayloadMode,
    headers: &BTreeMap<String, String>,
    max_size: u64,
) -> Result<(ByteStream, Option<u64>)> {
    let aws_chunked = headers
        .get("content-encoding")
        .is_some_and(|v| v.split(',').any(|e| e.trim() == "aws-chunked"));

    // Outer option: aws-chunked framing; inner: chunk signature chain
    let (chunked, digest) = match payload {
        PayloadMode::Streaming { signer } => (Some(signer), None),
        _ if aws_chunked => (Some(None), None),
        PayloadMode::Sha256(hash) => (None, Some(hash)),
        PayloadMode::Unsigned => (None, None),
    };

    let declared_header = if chunked.is_some() {
        "x-amz-decoded-content-length"
    } else {
        "content-length"
    };
    let declared = match headers.get(declared_header) {
        Some(v) => Some(v.trim().parse::<u64>().map_err(|_| {
            Error::InvalidArgument(format!("invalid {} header", declared_header))
        })?),
        None => None,
    };
    if declared.is_some_and(|len| len > max_size) {
        return Err(Error::EntityTooLarge);
    }

    let mut data = body_stream(body);
    if let Some(expected) = digest {
        data = verify_sha256(data, expected);
    }
    if let Some(signer) = chunked {
        data = decode_aws_chunked(data, signer);
    }
    Ok((enforce_length(data, declared, max_size), declared))
}

/// Check the body against a literal `x-amz-content-sha256` digest
pub fn verify_sha256(inner: ByteStream, expected: String) -> ByteStream {
    struct State {
        inner: ByteStream,
        hasher: Sha256Hasher,
        expected: String,
    }

    let state = State {
        inner,
        hasher: Sha256Hasher::new(),
        expected,
    };
    Box::pin(stream::try_unfold(state, |mut st| async move {
        match st.inner.try_next().await? {
            Some(chunk) => {
                st.hasher.update(&chunk);
                Ok(Some((chunk, st)))
            }
            None => {
                if st.hasher.finalize_hex() != st.expected {
                    return Err(Error::XAmzContentSHA256Mismatch);
                }
                Ok(None)
            }
        }
    }))
}

/// Fail when the body exceeds `max_size` or differs from the declared length
pub fn enforce_length(inner: ByteStream, expected: Option<u64>, max_size: u64) -> ByteStream {
    let state = (inner, 0u64);
    Box::pin(stream::try_unfold(state, move |(mut inner, seen)| async move {
        match inner.try_next().await? {
            Some(chunk) => {
                let seen = seen + chunk.len() as u64;
                if seen > max_size {
                    return Err(Error::EntityTooLarge);
                }
                if expected.is_some_and(|len| seen > len) {
                    return Err(Error::IncompleteBody);
                }
                Ok(Some((chunk, (inner, seen))))
            }
            None => {
                if expected.is_some_and(|len| seen != len) {
                    return Err(Error::IncompleteBody);
                }
                Ok(None)
            }
        }
    }))
}

/// Decode `Content-Encoding: aws-chunked` framing.
///
/// With a signer every chunk signature, the zero-length terminator included,
/// must chain from the seed signature. Trailers after the terminator are
/// consumed and ignored.
pub fn decode_aws_chunked(inner: ByteStream, signer: Option<ChunkSigner>) -> ByteStream {
    let decoder = ChunkDecoder {
        inner,
        buf: BytesMut::new(),
        signer,
    };
    Box::pin(stream::try_unfold(decoder, |mut d| async move {
        Ok::<_, Error>(d.next_chunk().await?.map(|chunk| (chunk, d)))
    }))
}

struct ChunkDecoder {
    inner: ByteStream,
    buf: BytesMut,
    signer: Option<ChunkSigner>,
}

impl ChunkDecoder {
    /// Pull more input; false once the body is exhausted
    async fn fill(&mut self) -> Result<bool> {
        match self.inner.try_next().await? {
            Some(bytes) => {
                self.buf.extend_from_slice(&bytes);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos);
                self.buf.advance(2);
                return String::from_utf8(line.to_vec())
                    .map_err(|_| Error::InvalidRequest("invalid aws-chunked header".into()));
            }
            if self.buf.len() > MAX_CHUNK_HEADER_LEN {
                return Err(Error::InvalidRequest("aws-chunked header too long".into()));
            }
            if !self.fill().await? {
                return Err(Error::IncompleteBody);
            }
        }
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let line = self.read_line().await?;
        let (size, signature) = parse_chunk_header(&line)?;

        if size == 0 {
            self.verify(&[], signature.as_deref())?;
            while self.inner.try_next().await?.is_some() {}
            return Ok(None);
        }

        while self.buf.len() < size + 2 {
            if !self.fill().await? {
                return Err(Error::IncompleteBody);
            }
        }
        let data = self.buf.split_to(size).freeze();
        if &self.buf[..2] != b"\r\n" {
            return Err(Error::InvalidRequest("aws-chunked data not followed by CRLF".into()));
        }
        self.buf.advance(2);

        self.verify(&data, signature.as_deref())?;
        Ok(Some(data))
    }

    fn verify(&mut self, data: &[u8], signature: Option<&str>) -> Result<()> {
        match self.signer.as_mut() {
            None => Ok(()),
            Some(signer) => {
                let signature = signature.ok_or(Error::SignatureDoesNotMatch)?;
                signer.verify_chunk(data, signature)
            }
        }
    }
}

/// `<hex size>[;chunk-signature=<sig>]`
fn parse_chunk_header(line: &str) -> Result<(usize, Option<String>)> {
    let mut parts = line.split(';');
    let size_str = parts.next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size_str, 16)
        .map_err(|_| Error::InvalidRequest(format!("invalid chunk size '{}'", size_str)))?;
    if size > MAX_CHUNK_SIZE {
        return Err(Error::InvalidRequest("aws-chunked chunk too large".into()));
    }

    let signature = parts.find_map(|ext| {
        ext.trim()
            .strip_prefix("chunk-signature=")
            .map(str::to_string)
    });
    Ok((size, signature))
}
