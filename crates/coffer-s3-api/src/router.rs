//! Request routing
//!
//! S3 overloads each HTTP verb with several operations that differ only in
//! their query parameters. [`resolve`] walks an ordered dispatch table and the
//! first [`Route`] whose method, scope and trigger parameters match decides the
//! [`Operation`]. Per-operation parameter contracts are checked afterwards.

use coffer_core::{Error, Result, MAX_PARTS};
use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    // Service
    ListBuckets,

    // Bucket
    CreateBucket,
    HeadBucket,
    DeleteBucket,
    GetBucketLocation,
    ListObjects,
    ListObjectsV2,
    ListMultipartUploads,

    // Object
    PutObject,
    GetObject,
    HeadObject,
    DeleteObject,

    // Multipart
    InitiateMultipartUpload,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    ListParts,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListBuckets => "ListBuckets",
            Self::CreateBucket => "CreateBucket",
            Self::HeadBucket => "HeadBucket",
            Self::DeleteBucket => "DeleteBucket",
            Self::GetBucketLocation => "GetBucketLocation",
            Self::ListObjects => "ListObjects",
            Self::ListObjectsV2 => "ListObjectsV2",
            Self::ListMultipartUploads => "ListMultipartUploads",
            Self::PutObject => "PutObject",
            Self::GetObject => "GetObject",
            Self::HeadObject => "HeadObject",
            Self::DeleteObject => "DeleteObject",
            Self::InitiateMultipartUpload => "CreateMultipartUpload",
            Self::UploadPart => "UploadPart",
            Self::CompleteMultipartUpload => "CompleteMultipartUpload",
            Self::AbortMultipartUpload => "AbortMultipartUpload",
            Self::ListParts => "ListParts",
        }
    }

    /// Operations whose request body is object data
    pub fn has_data_body(&self) -> bool {
        matches!(self, Self::PutObject | Self::UploadPart)
    }
}

/// What the request path addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Service,
    Bucket,
    Object,
}

/// One dispatch table entry
#[derive(Debug)]
pub struct Route {
    pub method: &'static str,
    pub scope: Scope,
    /// Query keys that must all be present
    pub triggers: &'static [&'static str],
    /// Query key that must carry this exact value
    pub value: Option<(&'static str, &'static str)>,
    pub operation: Operation,
}

const fn route(
    method: &'static str,
    scope: Scope,
    triggers: &'static [&'static str],
    operation: Operation,
) -> Route {
    Route {
        method,
        scope,
        triggers,
        value: None,
        operation,
    }
}

/// Ordered dispatch table; more specific entries precede the catch-alls
pub static ROUTES: &[Route] = &[
    route("GET", Scope::Service, &[], Operation::ListBuckets),
    route("PUT", Scope::Bucket, &[], Operation::CreateBucket),
    route("HEAD", Scope::Bucket, &[], Operation::HeadBucket),
    route("DELETE", Scope::Bucket, &[], Operation::DeleteBucket),
    route("GET", Scope::Bucket, &["location"], Operation::GetBucketLocation),
    route("GET", Scope::Bucket, &["uploads"], Operation::ListMultipartUploads),
    Route {
        method: "GET",
        scope: Scope::Bucket,
        triggers: &[],
        value: Some(("list-type", "2")),
        operation: Operation::ListObjectsV2,
    },
    route("GET", Scope::Bucket, &[], Operation::ListObjects),
    route("PUT", Scope::Object, &["uploadId"], Operation::UploadPart),
    route("PUT", Scope::Object, &["partNumber"], Operation::UploadPart),
    route("PUT", Scope::Object, &[], Operation::PutObject),
    route("GET", Scope::Object, &["uploadId"], Operation::ListParts),
    route("GET", Scope::Object, &[], Operation::GetObject),
    route("HEAD", Scope::Object, &[], Operation::HeadObject),
    route("POST", Scope::Object, &["uploads"], Operation::InitiateMultipartUpload),
    route("POST", Scope::Object, &["uploadId"], Operation::CompleteMultipartUpload),
    route("DELETE", Scope::Object, &["uploadId"], Operation::AbortMultipartUpload),
    route("DELETE", Scope::Object, &[], Operation::DeleteObject),
];

/// Sub-resources this server does not implement
const UNSUPPORTED_SUBRESOURCES: &[&str] = &[
    "accelerate",
    "acl",
    "analytics",
    "attributes",
    "cors",
    "delete",
    "encryption",
    "intelligent-tiering",
    "inventory",
    "legal-hold",
    "lifecycle",
    "logging",
    "metrics",
    "notification",
    "object-lock",
    "ownershipControls",
    "policy",
    "policyStatus",
    "publicAccessBlock",
    "replication",
    "requestPayment",
    "restore",
    "retention",
    "select",
    "tagging",
    "torrent",
    "versioning",
    "versions",
    "website",
];

impl Route {
    fn matches(&self, method: &str, scope: Scope, query: &BTreeMap<String, String>) -> bool {
        self.method == method
            && self.scope == scope
            && self.triggers.iter().all(|t| query.contains_key(*t))
            && self
                .value
                .map_or(true, |(k, v)| query.get(k).is_some_and(|actual| actual == v))
    }
}

/// A request resolved to its operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Request {
    pub operation: Operation,
    pub bucket: Option<String>,
    pub key: Option<String>,
    /// Decoded query parameters; the first occurrence of a repeated key wins
    pub query: BTreeMap<String, String>,
    pub upload_id: Option<String>,
    pub part_number: Option<u32>,
}

impl S3Request {
    pub fn bucket_name(&self) -> &str {
        self.bucket.as_deref().unwrap_or_default()
    }

    pub fn object_key(&self) -> &str {
        self.key.as_deref().unwrap_or_default()
    }

    pub fn upload_id(&self) -> &str {
        self.upload_id.as_deref().unwrap_or_default()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Non-empty query parameter
    pub fn non_empty_param(&self, name: &str) -> Option<&str> {
        self.param(name).filter(|v| !v.is_empty())
    }

    /// Parse a numeric query parameter
    pub fn number_param(&self, name: &str) -> Result<Option<u64>> {
        match self.non_empty_param(name) {
            None => Ok(None),
            Some(raw) => raw.parse::<u64>().map(Some).map_err(|_| {
                Error::InvalidArgument(format!("{} must be a non-negative integer", name))
            }),
        }
    }
}

/// Resolve a request into its operation.
///
/// `path` is the raw, still percent-encoded request path and `headers` uses
/// lowercased names.
pub fn resolve(
    method: &str,
    path: &str,
    query: &str,
    headers: &BTreeMap<String, String>,
) -> Result<S3Request> {
    let (bucket, key) = split_path(path)?;
    let scope = match (&bucket, &key) {
        (None, _) => Scope::Service,
        (Some(_), None) => Scope::Bucket,
        (Some(_), Some(_)) => Scope::Object,
    };

    let mut params = BTreeMap::new();
    for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
        params.entry(k.into_owned()).or_insert_with(|| v.into_owned());
    }

    if let Some(sub) = UNSUPPORTED_SUBRESOURCES
        .iter()
        .find(|s| params.contains_key(**s))
    {
        return Err(Error::UnknownOperation(format!(
            "{} {}?{} is not implemented",
            method, path, sub
        )));
    }

    let operation = ROUTES
        .iter()
        .find(|r| r.matches(method, scope, &params))
        .map(|r| r.operation)
        .ok_or_else(|| {
            Error::UnknownOperation(format!("{} is not supported on {:?} resources", method, scope))
        })?;

    let mut request = S3Request {
        operation,
        bucket,
        key,
        query: params,
        upload_id: None,
        part_number: None,
    };
    check_contract(&mut request, headers)?;
    Ok(request)
}

fn split_path(path: &str) -> Result<(Option<String>, Option<String>)> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return Ok((None, None));
    }

    let (raw_bucket, raw_key) = match trimmed.split_once('/') {
        Some((b, k)) => (b, Some(k)),
        None => (trimmed, None),
    };
    if raw_bucket.is_empty() {
        return Err(Error::MalformedRequest("empty bucket name in path".into()));
    }

    let bucket = decode(raw_bucket)?;
    let key = match raw_key {
        Some(k) if !k.is_empty() => Some(decode(k)?),
        _ => None,
    };
    Ok((Some(bucket), key))
}

fn decode(segment: &str) -> Result<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| Error::MalformedRequest("path is not valid UTF-8 after decoding".into()))
}

fn check_contract(req: &mut S3Request, headers: &BTreeMap<String, String>) -> Result<()> {
    match req.operation {
        Operation::UploadPart => {
            req.upload_id = Some(required_upload_id(req)?);
            let raw = req
                .non_empty_param("partNumber")
                .ok_or_else(|| Error::MissingRequiredParameter("partNumber".into()))?;
            let part_number = raw
                .parse::<u32>()
                .ok()
                .filter(|n| (1..=MAX_PARTS).contains(n))
                .ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "Part number must be an integer between 1 and {}",
                        MAX_PARTS
                    ))
                })?;
            req.part_number = Some(part_number);
        }
        Operation::CompleteMultipartUpload
        | Operation::AbortMultipartUpload
        | Operation::ListParts => {
            req.upload_id = Some(required_upload_id(req)?);
        }
        _ => {}
    }

    if req.operation.has_data_body() && !declares_length(headers) {
        return Err(Error::MissingRequiredParameter("Content-Length".into()));
    }
    Ok(())
}

fn required_upload_id(req: &S3Request) -> Result<String> {
    req.non_empty_param("uploadId")
        .map(str::to_string)
        .ok_or_else(|| Error::MissingRequiredParameter("uploadId".into()))
}

fn declares_length(headers: &BTreeMap<String, String>) -> bool {
    headers.contains_key("content-length")
        || headers.contains_key("x-amz-decoded-content-length")
        || headers
            .get("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
}
