//! Pre-signed URL generation and query-string authentication

use chrono::{DateTime, Duration, Utc};
use coffer_core::{Error, Result};
use std::collections::BTreeMap;
use url::{form_urlencoded, Url};

use crate::signature::canonical::{build_canonical_request, uri_encode};
use crate::signature::{
    compute_signature, parse_amz_date, parse_signed_headers, SigningScope, ALGORITHM,
    AMZ_DATE_FORMAT, UNSIGNED_PAYLOAD,
};

pub const X_AMZ_ALGORITHM: &str = "X-Amz-Algorithm";
pub const X_AMZ_CREDENTIAL: &str = "X-Amz-Credential";
pub const X_AMZ_DATE: &str = "X-Amz-Date";
pub const X_AMZ_EXPIRES: &str = "X-Amz-Expires";
pub const X_AMZ_SIGNED_HEADERS: &str = "X-Amz-SignedHeaders";
pub const X_AMZ_SIGNATURE: &str = "X-Amz-Signature";

/// Longest validity a presigned URL may declare (seven days)
pub const MAX_PRESIGNED_EXPIRY_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct PresignRequest {
    pub method: String,
    pub bucket: String,
    pub key: Option<String>,
    pub expires_in: u64,
}

/// Build a query-string-signed URL for `request`, valid from `now`
pub fn generate_presigned_url(
    request: &PresignRequest,
    endpoint: &str,
    access_key: &str,
    secret_key: &str,
    region: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    if request.expires_in == 0 || request.expires_in as i64 > MAX_PRESIGNED_EXPIRY_SECS {
        return Err(Error::InvalidArgument(format!(
            "expiry must be between 1 and {} seconds",
            MAX_PRESIGNED_EXPIRY_SECS
        )));
    }

    let host = extract_host(endpoint)?;
    let amz_date = now.format(AMZ_DATE_FORMAT).to_string();
    let scope = SigningScope::new(&now, region);
    let credential = format!("{}/{}", access_key, scope);

    let mut path = format!("/{}", uri_encode(&request.bucket));
    if let Some(key) = &request.key {
        path.push('/');
        path.push_str(
            &key.split('/')
                .map(uri_encode)
                .collect::<Vec<_>>()
                .join("/"),
        );
    }

    let mut params: Vec<(&str, String)> = vec![
        (X_AMZ_ALGORITHM, ALGORITHM.to_string()),
        (X_AMZ_CREDENTIAL, uri_encode(&credential)),
        (X_AMZ_DATE, amz_date.clone()),
        (X_AMZ_EXPIRES, request.expires_in.to_string()),
        (X_AMZ_SIGNED_HEADERS, "host".to_string()),
    ];
    params.sort();
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let mut headers = BTreeMap::new();
    headers.insert("host".to_string(), host);

    let canonical = build_canonical_request(
        &request.method.to_uppercase(),
        &path,
        &query,
        &headers,
        &["host".to_string()],
        UNSIGNED_PAYLOAD,
        None,
    )?;
    let signature = compute_signature(&scope.signing_key(secret_key), &amz_date, &scope, &canonical);

    Ok(format!(
        "{}{}?{}&{}={}",
        endpoint.trim_end_matches('/'),
        path,
        query,
        X_AMZ_SIGNATURE,
        signature
    ))
}

/// Check if a request is a pre-signed URL request
pub fn is_presigned_request(query_string: &str) -> bool {
    form_urlencoded::parse(query_string.as_bytes())
        .any(|(k, _)| k == X_AMZ_ALGORITHM || k == X_AMZ_SIGNATURE)
}

/// Authentication parameters carried in a presigned query string
#[derive(Debug, Clone)]
pub struct PresignedParams {
    pub access_key: String,
    pub scope: SigningScope,
    pub amz_date: String,
    pub request_time: DateTime<Utc>,
    pub expires: Duration,
    pub signed_headers: Vec<String>,
    pub signature: String,
}

impl PresignedParams {
    pub fn parse(query_string: &str) -> Result<Self> {
        let params: BTreeMap<String, String> = form_urlencoded::parse(query_string.as_bytes())
            .into_owned()
            .collect();

        let get = |name: &str| {
            params
                .get(name)
                .ok_or_else(|| Error::AuthorizationQueryParametersError(format!("missing {}", name)))
        };

        if get(X_AMZ_ALGORITHM)? != ALGORITHM {
            return Err(Error::AuthorizationQueryParametersError(
                "unsupported X-Amz-Algorithm".into(),
            ));
        }

        let (access_key, scope) = SigningScope::parse_credential(get(X_AMZ_CREDENTIAL)?)
            .map_err(|_| {
                Error::AuthorizationQueryParametersError("malformed X-Amz-Credential".into())
            })?;

        let amz_date = get(X_AMZ_DATE)?.clone();
        let request_time = parse_amz_date(&amz_date).ok_or_else(|| {
            Error::AuthorizationQueryParametersError("malformed X-Amz-Date".into())
        })?;

        let expires: i64 = get(X_AMZ_EXPIRES)?.parse().map_err(|_| {
            Error::AuthorizationQueryParametersError("X-Amz-Expires must be a number".into())
        })?;
        if expires <= 0 {
            return Err(Error::AuthorizationQueryParametersError(
                "X-Amz-Expires must be positive".into(),
            ));
        }
        if expires > MAX_PRESIGNED_EXPIRY_SECS {
            return Err(Error::AuthorizationQueryParametersError(format!(
                "X-Amz-Expires must be less than {} seconds",
                MAX_PRESIGNED_EXPIRY_SECS
            )));
        }

        Ok(Self {
            access_key,
            scope,
            amz_date,
            request_time,
            expires: Duration::seconds(expires),
            signed_headers: parse_signed_headers(get(X_AMZ_SIGNED_HEADERS)?),
            signature: get(X_AMZ_SIGNATURE)?.clone(),
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.request_time + self.expires
    }
}

fn extract_host(endpoint: &str) -> Result<String> {
    let url = Url::parse(endpoint)
        .map_err(|_| Error::InvalidArgument(format!("invalid endpoint URL '{}'", endpoint)))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidArgument("endpoint has no host".into()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request() -> PresignRequest {
        PresignRequest {
            method: "GET".to_string(),
            bucket: "my-bucket".to_string(),
            key: Some("dir/my object.txt".to_string()),
            expires_in: 3600,
        }
    }

    #[test]
    fn test_generate_presigned_url() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let url = generate_presigned_url(
            &request(),
            "http://localhost:9000/",
            "cofferadmin",
            "cofferadmin",
            "us-east-1",
            now,
        )
        .unwrap();

        assert!(url.starts_with("http://localhost:9000/my-bucket/dir/my%20object.txt?"));
        assert!(url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains("X-Amz-Credential=cofferadmin%2F20240102%2Fus-east-1%2Fs3%2Faws4_request"));
        assert!(url.contains("X-Amz-Date=20240102T030405Z"));
        assert!(url.contains("X-Amz-Signature="));

        let query = url.split_once('?').unwrap().1;
        assert!(is_presigned_request(query));

        let params = PresignedParams::parse(query).unwrap();
        assert_eq!(params.access_key, "cofferadmin");
        assert_eq!(params.request_time, now);
        assert_eq!(params.signed_headers, vec!["host"]);
        assert!(!params.is_expired(now + Duration::seconds(3600)));
        assert!(params.is_expired(now + Duration::seconds(3601)));
    }

    #[test]
    fn test_generate_rejects_bad_expiry() {
        let mut req = request();
        req.expires_in = 604801;
        assert!(generate_presigned_url(&req, "http://h", "a", "s", "us-east-1", Utc::now()).is_err());
        req.expires_in = 0;
        assert!(generate_presigned_url(&req, "http://h", "a", "s", "us-east-1", Utc::now()).is_err());
    }

    #[test]
    fn test_is_presigned_request() {
        assert!(is_presigned_request("X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Signature=abc"));
        assert!(!is_presigned_request("foo=bar"));
        assert!(!is_presigned_request(""));
    }

    #[test]
    fn test_params_validation() {
        let base = "X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Credential=AK%2F20240102%2Fus-east-1%2Fs3%2Faws4_request&X-Amz-Date=20240102T030405Z&X-Amz-SignedHeaders=host&X-Amz-Signature=00";

        assert!(PresignedParams::parse(&format!("{}&X-Amz-Expires=604800", base)).is_ok());
        for expires in ["604801", "0", "-5", "soon"] {
            assert!(matches!(
                PresignedParams::parse(&format!("{}&X-Amz-Expires={}", base, expires)),
                Err(Error::AuthorizationQueryParametersError(_))
            ));
        }
        assert!(matches!(
            PresignedParams::parse(base),
            Err(Error::AuthorizationQueryParametersError(_))
        ));
    }
}
