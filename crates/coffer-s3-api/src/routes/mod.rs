//! S3 API request handling
//!
//! Every S3 request lands in [`handle_s3_request`], which resolves the
//! operation through the router, authenticates it and dispatches to the
//! services. Responses and error documents are built here.

use axum::{
    body::Body,
    extract::State,
    http::{request::Parts, HeaderMap, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use coffer_auth::{signature::canonical::uri_encode, AuthOutcome, AuthRequest, PayloadMode};
use coffer_core::{
    error::S3Error,
    types::{ByteRange, ListObjectsParams, ListSessionsParams},
    utils::{format_http_datetime, generate_etag, generate_request_id},
    Error, Result, MAX_LIST_ENTRIES, MAX_PUT_SIZE,
};
use coffer_storage::collect_stream;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, error, info};

use crate::body::upload_stream;
use crate::metrics;
use crate::router::{self, Operation, S3Request};
use crate::server::AppState;
use crate::xml;

/// Owner reported for requests without an access key
const ANONYMOUS: &str = "anonymous";

/// Response under construction
struct S3Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
}

impl S3Response {
    fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::empty(),
        }
    }

    fn xml(body: String) -> Self {
        Self::new(StatusCode::OK)
            .header("content-type", "application/xml")
            .body(Body::from(body))
    }

    /// Values that are not valid header text are dropped
    fn header(mut self, name: &'static str, value: impl AsRef<str>) -> Self {
        match HeaderValue::from_str(value.as_ref()) {
            Ok(v) => {
                self.headers.insert(name, v);
            }
            Err(_) => debug!("Dropping invalid {} header value", name),
        }
        self
    }

    fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    fn finish(self, request_id: &str) -> Response {
        let mut response = (self.status, self.headers, self.body).into_response();
        if let Ok(v) = HeaderValue::from_str(request_id) {
            response.headers_mut().insert("x-amz-request-id", v);
        }
        response
    }
}

fn error_response(err: Error, request_id: &str, resource: &str, is_head: bool) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if err.is_internal() {
        error!("Request {} on {} failed: {}", request_id, resource, err);
    } else {
        debug!("Request {} on {} rejected: {}", request_id, resource, err);
    }

    let s3_error = S3Error::from(err)
        .with_request_id(request_id)
        .with_resource(resource);

    let response = S3Response::new(status);
    // HEAD responses carry the status only
    let response = if is_head {
        response
    } else {
        response
            .header("content-type", "application/xml")
            .body(Body::from(s3_error.to_xml()))
    };
    response.finish(request_id)
}

/// Lowercased header names; repeated headers are joined with `,`
fn header_table(parts: &Parts) -> BTreeMap<String, String> {
    let mut table: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in parts.headers.iter() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        table
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(value.trim());
            })
            .or_insert_with(|| value.trim().to_string());
    }
    // HTTP/2 clients send the authority instead of a host header
    if !table.contains_key("host") {
        if let Some(authority) = parts.uri.authority() {
            table.insert("host".to_string(), authority.to_string());
        }
    }
    table
}

/// Fallback handler for every S3 request
pub async fn handle_s3_request(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = generate_request_id();
    let start = Instant::now();

    let (parts, body) = request.into_parts();
    let is_head = parts.method == Method::HEAD;
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().unwrap_or_default().to_string();
    let headers = header_table(&parts);

    let s3_request = match router::resolve(parts.method.as_str(), &path, &query, &headers) {
        Ok(r) => r,
        Err(e) => return error_response(e, &request_id, &path, is_head),
    };
    let operation = s3_request.operation;

    let auth = state.verifier.verify(&AuthRequest {
        method: parts.method.as_str(),
        path: &path,
        query: &query,
        headers: &headers,
    });

    let result = match auth {
        Ok(auth) => {
            info!(
                "{} bucket={} key={} request_id={}",
                operation.as_str(),
                s3_request.bucket_name(),
                s3_request.object_key(),
                request_id
            );
            dispatch(&state, &s3_request, auth, &headers, body).await
        }
        Err(e) => Err(e),
    };

    metrics::record_s3_operation(operation, result.is_ok(), start.elapsed().as_secs_f64());

    match result {
        Ok(response) => response.finish(&request_id),
        Err(e) => error_response(e, &request_id, &path, is_head),
    }
}

async fn dispatch(
    state: &AppState,
    req: &S3Request,
    auth: AuthOutcome,
    headers: &BTreeMap<String, String>,
    body: Body,
) -> Result<S3Response> {
    let principal = auth.access_key.as_deref();
    let bucket = req.bucket_name();
    let key = req.object_key();

    match req.operation {
        Operation::ListBuckets => {
            let buckets = state.buckets.list_buckets().await?;
            let owner = principal.unwrap_or(ANONYMOUS);
            Ok(S3Response::xml(xml::list_buckets_response(&buckets, owner)))
        }

        Operation::CreateBucket => {
            // The optional CreateBucketConfiguration is read so its digest is checked
            read_small_body(state, body, auth.payload, headers).await?;
            state.buckets.create_bucket(bucket).await?;
            Ok(S3Response::new(StatusCode::OK).header("location", format!("/{}", bucket)))
        }

        Operation::HeadBucket => {
            let info = state.buckets.head_bucket(bucket).await?;
            Ok(S3Response::new(StatusCode::OK).header("x-amz-bucket-region", info.region))
        }

        Operation::DeleteBucket => {
            state.buckets.delete_bucket(bucket).await?;
            Ok(S3Response::new(StatusCode::NO_CONTENT))
        }

        Operation::GetBucketLocation => {
            let region = state.buckets.location(bucket).await?;
            Ok(S3Response::xml(xml::location_response(&region)))
        }

        Operation::ListObjects => {
            let params = ListObjectsParams {
                prefix: req.param("prefix").unwrap_or_default().to_string(),
                delimiter: req.non_empty_param("delimiter").map(str::to_string),
                marker: req.non_empty_param("marker").map(str::to_string),
                max_keys: page_size(req, "max-keys")?,
            };
            let listing = state.objects.list_objects(bucket, &params).await?;
            Ok(S3Response::xml(xml::list_objects_response(
                bucket, &params, &listing,
            )))
        }

        Operation::ListObjectsV2 => {
            let continuation_token = req.non_empty_param("continuation-token");
            let start_after = req.non_empty_param("start-after");
            let marker = match continuation_token {
                Some(token) => Some(decode_continuation_token(token)?),
                None => start_after.map(str::to_string),
            };
            let params = ListObjectsParams {
                prefix: req.param("prefix").unwrap_or_default().to_string(),
                delimiter: req.non_empty_param("delimiter").map(str::to_string),
                marker,
                max_keys: page_size(req, "max-keys")?,
            };
            let listing = state.objects.list_objects(bucket, &params).await?;
            let echo = xml::ListV2Echo {
                continuation_token: continuation_token.map(str::to_string),
                next_continuation_token: listing
                    .next_marker
                    .as_deref()
                    .map(|m| BASE64.encode(m.as_bytes())),
                start_after: start_after.map(str::to_string),
            };
            Ok(S3Response::xml(xml::list_objects_v2_response(
                bucket, &params, &listing, &echo,
            )))
        }

        Operation::ListMultipartUploads => {
            let params = ListSessionsParams {
                bucket: Some(bucket.to_string()),
                prefix: req.param("prefix").unwrap_or_default().to_string(),
                key_marker: req.non_empty_param("key-marker").map(str::to_string),
                upload_id_marker: req.non_empty_param("upload-id-marker").map(str::to_string),
                max_uploads: page_size(req, "max-uploads")?,
                initiated_before: None,
            };
            let listing = state.multipart.list_uploads(bucket, params.clone()).await?;
            Ok(S3Response::xml(xml::list_multipart_uploads_response(
                bucket, &params, &listing,
            )))
        }

        Operation::PutObject => {
            let content_type = content_type_for(headers, key);
            let (data, size_hint) = upload_stream(body, auth.payload, headers, MAX_PUT_SIZE)?;
            let meta = state
                .objects
                .put_object(
                    bucket,
                    key,
                    &content_type,
                    data,
                    size_hint,
                    headers.get("content-md5").map(String::as_str),
                )
                .await?;
            Ok(S3Response::new(StatusCode::OK).header("etag", generate_etag(&meta.etag)))
        }

        Operation::GetObject => {
            let range = requested_range(headers);
            let read = state.objects.get_object(bucket, key, range).await?;
            let content_length = read.content_length();
            let mut response = object_headers(S3Response::new(StatusCode::OK), &read.meta)
                .header("content-length", content_length.to_string());
            if let Some((start, end)) = read.range {
                response.status = StatusCode::PARTIAL_CONTENT;
                response = response.header(
                    "content-range",
                    format!("bytes {}-{}/{}", start, end, read.meta.size),
                );
            }
            Ok(response.body(Body::from_stream(read.body)))
        }

        Operation::HeadObject => {
            let meta = state.objects.head_object(bucket, key).await?;
            let mut response = object_headers(S3Response::new(StatusCode::OK), &meta);
            match requested_range(headers) {
                Some(range) => {
                    let (start, end) = range.resolve(meta.size)?;
                    response.status = StatusCode::PARTIAL_CONTENT;
                    response = response
                        .header("content-length", (end - start + 1).to_string())
                        .header(
                            "content-range",
                            format!("bytes {}-{}/{}", start, end, meta.size),
                        );
                }
                None => {
                    response = response.header("content-length", meta.size.to_string());
                }
            }
            Ok(response)
        }

        Operation::DeleteObject => {
            state.objects.delete_object(bucket, key).await?;
            Ok(S3Response::new(StatusCode::NO_CONTENT))
        }

        Operation::InitiateMultipartUpload => {
            let content_type = content_type_for(headers, key);
            let session = state
                .multipart
                .initiate(bucket, key, &content_type, auth.access_key.clone())
                .await?;
            Ok(S3Response::xml(xml::initiate_multipart_upload_response(
                bucket,
                key,
                &session.upload_id,
            )))
        }

        Operation::UploadPart => {
            let part_number = req
                .part_number
                .ok_or_else(|| Error::MissingRequiredParameter("partNumber".into()))?;
            let (data, _) = upload_stream(body, auth.payload, headers, MAX_PUT_SIZE)?;
            let part = state
                .multipart
                .upload_part(
                    bucket,
                    key,
                    req.upload_id(),
                    part_number,
                    data,
                    headers.get("content-md5").map(String::as_str),
                    principal,
                )
                .await?;
            Ok(S3Response::new(StatusCode::OK).header("etag", generate_etag(&part.etag)))
        }

        Operation::CompleteMultipartUpload => {
            let document = read_small_body(state, body, auth.payload, headers).await?;
            let requested = xml::parse_complete_multipart(&document)?;
            let meta = state
                .multipart
                .complete(bucket, key, req.upload_id(), &requested, principal)
                .await?;
            let location = object_url(headers, bucket, key);
            Ok(S3Response::xml(xml::complete_multipart_upload_response(
                &location, &meta,
            )))
        }

        Operation::AbortMultipartUpload => {
            state
                .multipart
                .abort(bucket, key, req.upload_id(), principal)
                .await?;
            Ok(S3Response::new(StatusCode::NO_CONTENT))
        }

        Operation::ListParts => {
            let marker = match req.number_param("part-number-marker")? {
                None => 0,
                Some(n) => u32::try_from(n).map_err(|_| {
                    Error::InvalidArgument("part-number-marker is out of range".into())
                })?,
            };
            let max_parts = page_size(req, "max-parts")?;
            let (session, page) = state
                .multipart
                .list_parts(bucket, key, req.upload_id(), marker, max_parts, principal)
                .await?;
            Ok(S3Response::xml(xml::list_parts_response(&session, &page)))
        }
    }
}

/// Page size parameter, defaulting to and capped at 1000
fn page_size(req: &S3Request, name: &str) -> Result<usize> {
    Ok(req
        .number_param(name)?
        .map_or(MAX_LIST_ENTRIES, |n| n.min(MAX_LIST_ENTRIES as u64) as usize))
}

fn decode_continuation_token(token: &str) -> Result<String> {
    BASE64
        .decode(token)
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .ok_or_else(|| {
            Error::InvalidArgument("The continuation token provided is incorrect".into())
        })
}

/// Explicit `Content-Type`, otherwise a guess from the key's extension
fn content_type_for(headers: &BTreeMap<String, String>, key: &str) -> String {
    match headers.get("content-type") {
        Some(ct) if !ct.is_empty() => ct.clone(),
        _ => mime_guess::from_path(key)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

/// A `Range` header we cannot parse is ignored and the whole object is served
fn requested_range(headers: &BTreeMap<String, String>) -> Option<ByteRange> {
    let raw = headers.get("range")?;
    match ByteRange::parse(raw) {
        Ok(range) => Some(range),
        Err(e) => {
            debug!("Ignoring range header '{}': {}", raw, e);
            None
        }
    }
}

fn object_headers(response: S3Response, meta: &coffer_core::types::ObjectMeta) -> S3Response {
    response
        .header("content-type", &meta.content_type)
        .header("etag", generate_etag(&meta.etag))
        .header("last-modified", format_http_datetime(&meta.last_modified))
        .header("accept-ranges", "bytes")
}

fn object_url(headers: &BTreeMap<String, String>, bucket: &str, key: &str) -> String {
    let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
    match headers.get("host") {
        Some(host) => format!("http://{}/{}/{}", host, bucket, encoded_key),
        None => format!("/{}/{}", bucket, encoded_key),
    }
}

/// Read a small control document, checking its payload digest
async fn read_small_body(
    state: &AppState,
    body: Body,
    payload: PayloadMode,
    headers: &BTreeMap<String, String>,
) -> Result<Vec<u8>> {
    let limit = state.config.server.max_xml_body_bytes as u64;
    let too_large = |e: Error| match e {
        Error::EntityTooLarge => {
            Error::MalformedXML(format!("request body exceeds {} bytes", limit))
        }
        other => other,
    };
    let (data, _) = upload_stream(body, payload, headers, limit).map_err(too_large)?;
    let bytes = collect_stream(data).await.map_err(too_large)?;
    Ok(bytes.to_vec())
}
