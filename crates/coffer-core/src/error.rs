//! Error types for Coffer

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Message returned to clients for every 5xx error
const INTERNAL_ERROR_MESSAGE: &str = "We encountered an internal error. Please try again.";

#[derive(Error, Debug)]
pub enum Error {
    // Bucket Errors
    #[error("The specified bucket does not exist")]
    NoSuchBucket,

    #[error("The requested bucket name is not available")]
    BucketAlreadyExists,

    #[error("The bucket you tried to delete is not empty")]
    BucketNotEmpty,

    // Object Errors
    #[error("The specified key does not exist")]
    NoSuchKey,

    #[error("The specified multipart upload does not exist")]
    NoSuchUpload,

    #[error("Invalid part: {0}")]
    InvalidPart(String),

    #[error("Your proposed upload is smaller than the minimum allowed size: {0}")]
    EntityTooSmall(String),

    #[error("Your proposed upload exceeds the maximum allowed size")]
    EntityTooLarge,

    #[error("The Content-MD5 you specified did not match what we received")]
    BadDigest,

    #[error("The Content-MD5 you specified is not valid")]
    InvalidDigest,

    #[error("You did not provide the number of bytes specified by the Content-Length header")]
    IncompleteBody,

    #[error("The provided 'x-amz-content-sha256' header does not match what was computed")]
    XAmzContentSHA256Mismatch,

    // Access Errors
    #[error("Access Denied")]
    AccessDenied,

    #[error("The AWS access key ID you provided does not exist in our records")]
    InvalidAccessKeyId,

    #[error("The request signature we calculated does not match the signature you provided")]
    SignatureDoesNotMatch,

    #[error("Request has expired")]
    ExpiredRequest,

    #[error("The difference between the request time and the server's time is too large")]
    RequestTimeTooSkewed,

    #[error("The authorization header is malformed: {0}")]
    AuthorizationHeaderMalformed(String),

    #[error("Error parsing the X-Amz-Credential parameter: {0}")]
    AuthorizationQueryParametersError(String),

    #[error("Your request is missing a required header: {0}")]
    MissingSecurityHeader(String),

    // Request Errors
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("The requested operation is not supported: {0}")]
    UnknownOperation(String),

    #[error("Missing required parameter: {0}")]
    MissingRequiredParameter(String),

    #[error("Invalid bucket name: {0}")]
    InvalidBucketName(String),

    #[error("Your key is too long")]
    KeyTooLong,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("The XML you provided was not well-formed or did not validate: {0}")]
    MalformedXML(String),

    #[error("The requested range is not satisfiable: {0}")]
    InvalidRange(String),

    // Backend Errors
    #[error("Storage backend error: {0}")]
    StorageError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::NoSuchBucket => "NoSuchBucket",
            Error::BucketAlreadyExists => "BucketAlreadyExists",
            Error::BucketNotEmpty => "BucketNotEmpty",
            Error::NoSuchKey => "NoSuchKey",
            Error::NoSuchUpload => "NoSuchUpload",
            Error::InvalidPart(_) => "InvalidPart",
            Error::EntityTooSmall(_) => "EntityTooSmall",
            Error::EntityTooLarge => "EntityTooLarge",
            Error::BadDigest => "BadDigest",
            Error::InvalidDigest => "InvalidDigest",
            Error::IncompleteBody => "IncompleteBody",
            Error::XAmzContentSHA256Mismatch => "XAmzContentSHA256Mismatch",
            Error::AccessDenied => "AccessDenied",
            Error::InvalidAccessKeyId => "InvalidAccessKeyId",
            Error::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            Error::ExpiredRequest => "AccessDenied",
            Error::RequestTimeTooSkewed => "RequestTimeTooSkewed",
            Error::AuthorizationHeaderMalformed(_) => "AuthorizationHeaderMalformed",
            Error::AuthorizationQueryParametersError(_) => "AuthorizationQueryParametersError",
            Error::MissingSecurityHeader(_) => "MissingSecurityHeader",
            Error::MalformedRequest(_) => "InvalidRequest",
            Error::UnknownOperation(_) => "NotImplemented",
            Error::MissingRequiredParameter(_) => "MissingParameter",
            Error::InvalidBucketName(_) => "InvalidBucketName",
            Error::KeyTooLong => "KeyTooLongError",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::InvalidRequest(_) => "InvalidRequest",
            Error::MalformedXML(_) => "MalformedXML",
            Error::InvalidRange(_) => "InvalidRange",
            Error::StorageError(_)
            | Error::DatabaseError(_)
            | Error::InternalError(_)
            | Error::Io(_)
            | Error::Other(_) => "InternalError",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidPart(_)
            | Error::EntityTooSmall(_)
            | Error::EntityTooLarge
            | Error::BadDigest
            | Error::InvalidDigest
            | Error::IncompleteBody
            | Error::XAmzContentSHA256Mismatch
            | Error::AuthorizationHeaderMalformed(_)
            | Error::AuthorizationQueryParametersError(_)
            | Error::MissingSecurityHeader(_)
            | Error::MalformedRequest(_)
            | Error::UnknownOperation(_)
            | Error::MissingRequiredParameter(_)
            | Error::InvalidBucketName(_)
            | Error::KeyTooLong
            | Error::InvalidArgument(_)
            | Error::InvalidRequest(_)
            | Error::MalformedXML(_) => 400,

            Error::AccessDenied
            | Error::InvalidAccessKeyId
            | Error::SignatureDoesNotMatch
            | Error::ExpiredRequest
            | Error::RequestTimeTooSkewed => 403,

            Error::NoSuchBucket | Error::NoSuchKey | Error::NoSuchUpload => 404,

            Error::BucketAlreadyExists | Error::BucketNotEmpty => 409,

            Error::InvalidRange(_) => 416,

            Error::StorageError(_)
            | Error::DatabaseError(_)
            | Error::InternalError(_)
            | Error::Io(_)
            | Error::Other(_) => 500,
        }
    }

    /// True for errors caused by the server rather than the request
    pub fn is_internal(&self) -> bool {
        self.http_status() >= 500
    }
}

/// S3 Error Response
#[derive(Debug, Clone)]
pub struct S3Error {
    pub code: String,
    pub message: String,
    pub resource: Option<String>,
    pub request_id: String,
}

impl From<Error> for S3Error {
    fn from(err: Error) -> Self {
        let message = if err.is_internal() {
            INTERNAL_ERROR_MESSAGE.to_string()
        } else {
            err.to_string()
        };
        S3Error {
            code: err.code().to_string(),
            message,
            resource: None,
            request_id: String::new(),
        }
    }
}

impl S3Error {
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn to_xml(&self) -> String {
        use crate::utils::xml_escape;

        let resource = self.resource.as_deref().unwrap_or("");
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
<Code>{}</Code>
<Message>{}</Message>
<Resource>{}</Resource>
<RequestId>{}</RequestId>
</Error>"#,
            xml_escape(&self.code),
            xml_escape(&self.message),
            xml_escape(resource),
            xml_escape(&self.request_id)
        )
    }
}
