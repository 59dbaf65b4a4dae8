//! XML response generation for the S3 API
//!
//! Element order follows the AWS documentation; several SDKs parse these
//! documents positionally.

use coffer_core::types::{
    Bucket, ListObjectsParams, ListSessionsParams, ObjectListing, ObjectMeta, SessionListing,
    UploadSession,
};
use coffer_core::utils::{format_s3_datetime, xml_escape};
use coffer_core::{Error, Result};
use serde::Deserialize;

use crate::services::PartListing;

const XML_HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;
const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Owner shown for anonymous principals
const ANONYMOUS_OWNER: &str = "anonymous";

fn open(xml: &mut String, root: &str) {
    xml.push_str(XML_HEADER);
    xml.push('\n');
    xml.push_str(&format!("<{} xmlns=\"{}\">\n", root, S3_NAMESPACE));
}

fn element(xml: &mut String, indent: usize, name: &str, value: &str) {
    xml.push_str(&" ".repeat(indent));
    xml.push_str(&format!("<{}>{}</{}>\n", name, xml_escape(value), name));
}

fn owner(xml: &mut String, indent: usize, tag: &str, id: &str) {
    let pad = " ".repeat(indent);
    xml.push_str(&format!("{}<{}>\n", pad, tag));
    element(xml, indent + 2, "ID", id);
    element(xml, indent + 2, "DisplayName", id);
    xml.push_str(&format!("{}</{}>\n", pad, tag));
}

/// Generate ListBuckets response XML
pub fn list_buckets_response(buckets: &[Bucket], owner_id: &str) -> String {
    let mut xml = String::new();
    open(&mut xml, "ListAllMyBucketsResult");
    owner(&mut xml, 2, "Owner", owner_id);

    xml.push_str("  <Buckets>\n");
    for bucket in buckets {
        xml.push_str("    <Bucket>\n");
        element(&mut xml, 6, "Name", &bucket.name);
        element(&mut xml, 6, "CreationDate", &format_s3_datetime(&bucket.created_at));
        xml.push_str("    </Bucket>\n");
    }
    xml.push_str("  </Buckets>\n");

    xml.push_str("</ListAllMyBucketsResult>");
    xml
}

/// `us-east-1` is reported as an empty constraint, as S3 does
pub fn location_response(region: &str) -> String {
    let constraint = if region == coffer_core::DEFAULT_REGION {
        ""
    } else {
        region
    };
    format!(
        "{}\n<LocationConstraint xmlns=\"{}\">{}</LocationConstraint>",
        XML_HEADER,
        S3_NAMESPACE,
        xml_escape(constraint)
    )
}

fn push_contents(xml: &mut String, objects: &[ObjectMeta]) {
    for obj in objects {
        xml.push_str("  <Contents>\n");
        element(xml, 4, "Key", &obj.key);
        element(xml, 4, "LastModified", &format_s3_datetime(&obj.last_modified));
        element(xml, 4, "ETag", &format!("\"{}\"", obj.etag));
        element(xml, 4, "Size", &obj.size.to_string());
        element(xml, 4, "StorageClass", "STANDARD");
        xml.push_str("  </Contents>\n");
    }
}

fn push_common_prefixes(xml: &mut String, prefixes: &[String]) {
    for prefix in prefixes {
        xml.push_str("  <CommonPrefixes>\n");
        element(xml, 4, "Prefix", prefix);
        xml.push_str("  </CommonPrefixes>\n");
    }
}

/// Generate ListObjects (v1) response XML
pub fn list_objects_response(
    bucket: &str,
    params: &ListObjectsParams,
    listing: &ObjectListing,
) -> String {
    let mut xml = String::new();
    open(&mut xml, "ListBucketResult");
    element(&mut xml, 2, "Name", bucket);
    element(&mut xml, 2, "Prefix", &params.prefix);
    element(&mut xml, 2, "Marker", params.marker.as_deref().unwrap_or(""));
    element(&mut xml, 2, "MaxKeys", &params.max_keys.to_string());
    if let Some(delimiter) = &params.delimiter {
        element(&mut xml, 2, "Delimiter", delimiter);
    }
    element(&mut xml, 2, "IsTruncated", &listing.is_truncated.to_string());
    // Without a delimiter clients continue from the last key themselves
    if params.delimiter.is_some() {
        if let Some(next) = &listing.next_marker {
            element(&mut xml, 2, "NextMarker", next);
        }
    }

    push_contents(&mut xml, &listing.objects);
    push_common_prefixes(&mut xml, &listing.common_prefixes);

    xml.push_str("</ListBucketResult>");
    xml
}

/// Request-side values echoed by ListObjectsV2
#[derive(Debug, Clone, Default)]
pub struct ListV2Echo {
    pub continuation_token: Option<String>,
    pub next_continuation_token: Option<String>,
    pub start_after: Option<String>,
}

/// Generate ListObjectsV2 response XML
pub fn list_objects_v2_response(
    bucket: &str,
    params: &ListObjectsParams,
    listing: &ObjectListing,
    echo: &ListV2Echo,
) -> String {
    let mut xml = String::new();
    open(&mut xml, "ListBucketResult");
    element(&mut xml, 2, "Name", bucket);
    element(&mut xml, 2, "Prefix", &params.prefix);
    if let Some(delimiter) = &params.delimiter {
        element(&mut xml, 2, "Delimiter", delimiter);
    }
    element(&mut xml, 2, "MaxKeys", &params.max_keys.to_string());
    let key_count = listing.objects.len() + listing.common_prefixes.len();
    element(&mut xml, 2, "KeyCount", &key_count.to_string());
    element(&mut xml, 2, "IsTruncated", &listing.is_truncated.to_string());
    if let Some(token) = &echo.continuation_token {
        element(&mut xml, 2, "ContinuationToken", token);
    }
    if let Some(token) = &echo.next_continuation_token {
        element(&mut xml, 2, "NextContinuationToken", token);
    }
    if let Some(start_after) = &echo.start_after {
        element(&mut xml, 2, "StartAfter", start_after);
    }

    push_contents(&mut xml, &listing.objects);
    push_common_prefixes(&mut xml, &listing.common_prefixes);

    xml.push_str("</ListBucketResult>");
    xml
}

// ============= Multipart Upload =============

pub fn initiate_multipart_upload_response(bucket: &str, key: &str, upload_id: &str) -> String {
    let mut xml = String::new();
    open(&mut xml, "InitiateMultipartUploadResult");
    element(&mut xml, 2, "Bucket", bucket);
    element(&mut xml, 2, "Key", key);
    element(&mut xml, 2, "UploadId", upload_id);
    xml.push_str("</InitiateMultipartUploadResult>");
    xml
}

pub fn complete_multipart_upload_response(location: &str, meta: &ObjectMeta) -> String {
    let mut xml = String::new();
    open(&mut xml, "CompleteMultipartUploadResult");
    element(&mut xml, 2, "Location", location);
    element(&mut xml, 2, "Bucket", &meta.bucket);
    element(&mut xml, 2, "Key", &meta.key);
    element(&mut xml, 2, "ETag", &format!("\"{}\"", meta.etag));
    xml.push_str("</CompleteMultipartUploadResult>");
    xml
}

pub fn list_parts_response(session: &UploadSession, page: &PartListing) -> String {
    let initiator = session.initiator.as_deref().unwrap_or(ANONYMOUS_OWNER);

    let mut xml = String::new();
    open(&mut xml, "ListPartsResult");
    element(&mut xml, 2, "Bucket", &session.bucket);
    element(&mut xml, 2, "Key", &session.key);
    element(&mut xml, 2, "UploadId", &session.upload_id);
    owner(&mut xml, 2, "Initiator", initiator);
    owner(&mut xml, 2, "Owner", initiator);
    element(&mut xml, 2, "StorageClass", "STANDARD");
    element(&mut xml, 2, "PartNumberMarker", &page.part_number_marker.to_string());
    if let Some(next) = page.next_part_number_marker {
        element(&mut xml, 2, "NextPartNumberMarker", &next.to_string());
    }
    element(&mut xml, 2, "MaxParts", &page.max_parts.to_string());
    element(&mut xml, 2, "IsTruncated", &page.is_truncated.to_string());

    for part in &page.parts {
        xml.push_str("  <Part>\n");
        element(&mut xml, 4, "PartNumber", &part.part_number.to_string());
        element(&mut xml, 4, "LastModified", &format_s3_datetime(&part.last_modified));
        element(&mut xml, 4, "ETag", &format!("\"{}\"", part.etag));
        element(&mut xml, 4, "Size", &part.size.to_string());
        xml.push_str("  </Part>\n");
    }

    xml.push_str("</ListPartsResult>");
    xml
}

pub fn list_multipart_uploads_response(
    bucket: &str,
    params: &ListSessionsParams,
    listing: &SessionListing,
) -> String {
    let mut xml = String::new();
    open(&mut xml, "ListMultipartUploadsResult");
    element(&mut xml, 2, "Bucket", bucket);
    element(&mut xml, 2, "KeyMarker", params.key_marker.as_deref().unwrap_or(""));
    element(
        &mut xml,
        2,
        "UploadIdMarker",
        params.upload_id_marker.as_deref().unwrap_or(""),
    );
    if let Some(next) = &listing.next_key_marker {
        element(&mut xml, 2, "NextKeyMarker", next);
    }
    if let Some(next) = &listing.next_upload_id_marker {
        element(&mut xml, 2, "NextUploadIdMarker", next);
    }
    element(&mut xml, 2, "Prefix", &params.prefix);
    element(&mut xml, 2, "MaxUploads", &params.max_uploads.to_string());
    element(&mut xml, 2, "IsTruncated", &listing.is_truncated.to_string());

    for upload in &listing.sessions {
        let initiator = upload.initiator.as_deref().unwrap_or(ANONYMOUS_OWNER);
        xml.push_str("  <Upload>\n");
        element(&mut xml, 4, "Key", &upload.key);
        element(&mut xml, 4, "UploadId", &upload.upload_id);
        owner(&mut xml, 4, "Initiator", initiator);
        owner(&mut xml, 4, "Owner", initiator);
        element(&mut xml, 4, "StorageClass", "STANDARD");
        element(&mut xml, 4, "Initiated", &format_s3_datetime(&upload.created_at));
        xml.push_str("  </Upload>\n");
    }

    xml.push_str("</ListMultipartUploadsResult>");
    xml
}

#[derive(Debug, Deserialize)]
struct CompleteMultipartUploadRequest {
    #[serde(rename = "Part", default)]
    parts: Vec<CompletedPart>,
}

#[derive(Debug, Deserialize)]
struct CompletedPart {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
}

/// Parse a CompleteMultipartUpload body into `(part number, ETag)` pairs, in document order
pub fn parse_complete_multipart(body: &[u8]) -> Result<Vec<(u32, String)>> {
    let text = std::str::from_utf8(body)
        .map_err(|_| Error::MalformedXML("body is not valid UTF-8".into()))?;
    let request: CompleteMultipartUploadRequest =
        quick_xml::de::from_str(text).map_err(|e| Error::MalformedXML(e.to_string()))?;

    Ok(request
        .parts
        .into_iter()
        .map(|p| (p.part_number, p.etag))
        .collect())
}
