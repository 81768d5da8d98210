//! Write gating: decides whether a completed write produces an enrichment
//! event. Pure with respect to its inputs; publishing happens elsewhere.

use crate::policy::PolicyError;
use crate::topology::{Topology, TopologyError};
use axum::http::{HeaderMap, HeaderName, Method};
use insight_pipeline::{EnrichmentEvent, Timestamp, TIMESTAMP_HEADER};
use percent_encoding::percent_decode_str;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// The parts of a completed write the gates look at
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub account: String,
    pub container: String,
    pub object: String,
}

impl WriteRequest {
    pub fn new(
        method: Method,
        headers: HeaderMap,
        account: impl Into<String>,
        container: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            method,
            headers,
            account: account.into(),
            container: container.into(),
            object: object.into(),
        }
    }

    /// Split a `/{version}/{account}/{container}/{object...}` request path.
    /// Missing segments come back empty; anything shorter than a version and
    /// an account, or with a segment that is not UTF-8 once decoded, is not a
    /// storage path at all.
    pub fn from_path(method: Method, headers: HeaderMap, path: &str) -> Option<Self> {
        let mut segments = path.trim_start_matches('/').splitn(4, '/');
        let _version = segments.next().filter(|v| !v.is_empty())?;
        let account = segments.next()?;
        let container = segments.next().unwrap_or_default();
        let object = segments.next().unwrap_or_default();

        Some(Self::new(
            method,
            headers,
            percent_decode(account)?,
            percent_decode(container)?,
            percent_decode(object)?,
        ))
    }
}

/// Decode `%XX` escapes; malformed escapes are kept verbatim, a segment
/// that does not decode to UTF-8 is rejected
fn percent_decode(input: &str) -> Option<String> {
    percent_decode_str(input)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

/// Why a write was not enriched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotOptedIn,
    MethodNotEligible(Method),
    PolicyUnresolved(PolicyError),
    PolicyNotFileAccessible(u32),
    NotAnImage(Option<String>),
    IncompletePath,
    Topology(TopologyError),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOptedIn => write!(f, "enrichment not requested"),
            Self::MethodNotEligible(method) => write!(f, "method {} is not a write", method),
            Self::PolicyUnresolved(e) => write!(f, "{}", e),
            Self::PolicyNotFileAccessible(index) => {
                write!(f, "policy {} is not file-accessible", index)
            }
            Self::NotAnImage(Some(ext)) => write!(f, "extension '{}' is not an image type", ext),
            Self::NotAnImage(None) => write!(f, "object has no extension"),
            Self::IncompletePath => write!(f, "account, container or object is empty"),
            Self::Topology(e) => write!(f, "{}", e),
        }
    }
}

impl SkipReason {
    /// Short label for metrics
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::NotOptedIn => "not_opted_in",
            Self::MethodNotEligible(_) => "method",
            Self::PolicyUnresolved(_) => "policy_unresolved",
            Self::PolicyNotFileAccessible(_) => "policy_not_file_accessible",
            Self::NotAnImage(_) => "not_an_image",
            Self::IncompletePath => "incomplete_path",
            Self::Topology(_) => "topology",
        }
    }
}

/// Outcome of gating one write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Publish(EnrichmentEvent),
    Skip(SkipReason),
}

/// Gate chain applied to every completed write
#[derive(Debug)]
pub struct EventFilter {
    topology: Arc<Topology>,
    image_types: HashSet<String>,
    opt_in_header: HeaderName,
}

impl EventFilter {
    pub fn new(
        topology: Arc<Topology>,
        image_types: impl IntoIterator<Item = impl Into<String>>,
        opt_in_header: HeaderName,
    ) -> Self {
        Self {
            topology,
            image_types: image_types.into_iter().map(Into::into).collect(),
            opt_in_header,
        }
    }

    pub fn evaluate(&self, request: &WriteRequest) -> Decision {
        if !request.headers.contains_key(&self.opt_in_header) {
            return Decision::Skip(SkipReason::NotOptedIn);
        }

        if request.method != Method::PUT {
            return Decision::Skip(SkipReason::MethodNotEligible(request.method.clone()));
        }

        let policy = match self.topology.resolve_policy(&request.headers) {
            Ok(policy) => policy,
            Err(e) => return Decision::Skip(SkipReason::PolicyUnresolved(e)),
        };
        if !self.topology.is_file_accessible(policy) {
            return Decision::Skip(SkipReason::PolicyNotFileAccessible(policy));
        }

        match request.object.rsplit_once('.') {
            Some((_, ext)) if self.image_types.contains(ext) => {}
            Some((_, ext)) => return Decision::Skip(SkipReason::NotAnImage(Some(ext.to_string()))),
            None => return Decision::Skip(SkipReason::NotAnImage(None)),
        }

        if request.account.is_empty() || request.container.is_empty() || request.object.is_empty()
        {
            return Decision::Skip(SkipReason::IncompletePath);
        }

        let dir = match self
            .topology
            .resolve(&request.account, &request.container, policy)
        {
            Ok(dir) => dir,
            Err(e) => return Decision::Skip(SkipReason::Topology(e)),
        };

        let timestamp = request
            .headers
            .get(TIMESTAMP_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Timestamp>().ok())
            .unwrap_or(Timestamp::EPOCH);

        let path = format!("{}/{}", dir.display(), request.object);
        Decision::Publish(EnrichmentEvent::new(path, timestamp))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::policy::{PolicyRegistry, StoragePolicy, FILE_ACCESS_FUNCTION};
    use crate::topology::{Device, HashPath, Ring};
    use axum::http::HeaderValue;
    use std::collections::HashMap;

    pub(crate) fn topology() -> Arc<Topology> {
        let policies = PolicyRegistry::new(vec![
            StoragePolicy::new(0, "gold").default_policy(),
            StoragePolicy::new(1, "sof").with_function(FILE_ACCESS_FUNCTION),
            StoragePolicy::new(2, "legacy")
                .with_function(FILE_ACCESS_FUNCTION)
                .deprecated(),
        ])
        .unwrap();
        let ring = Ring::new(
            0,
            vec![Some(Device {
                id: 0,
                device: "gpfs0".to_string(),
                ip: None,
                port: None,
            })],
            vec![vec![0]],
        )
        .unwrap();
        let mut rings = HashMap::new();
        rings.insert(1, Ok(ring.clone()));
        rings.insert(2, Ok(ring));
        Arc::new(Topology::new(
            policies,
            rings,
            "/srv/node",
            HashPath::new("", "changeme"),
        ))
    }

    pub(crate) fn filter() -> EventFilter {
        EventFilter::new(
            topology(),
            ["jpg", "jpeg", "png"],
            HeaderName::from_static("x-visual-insights-enable"),
        )
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    fn opted_in() -> HeaderMap {
        headers(&[
            ("x-visual-insights-enable", "true"),
            ("x-storage-policy", "sof"),
            ("x-timestamp", "1463745600.12345"),
        ])
    }

    fn put(headers: HeaderMap, object: &str) -> WriteRequest {
        WriteRequest::new(Method::PUT, headers, "AUTH_test", "photos", object)
    }

    #[test]
    fn test_publishes_qualifying_write() {
        let decision = filter().evaluate(&put(opted_in(), "cats/tabby.jpg"));
        let Decision::Publish(event) = decision else {
            panic!("expected publish, got {:?}", decision);
        };
        assert_eq!(event.path, "/srv/node/gpfs0/AUTH_test/photos/cats/tabby.jpg");
        assert_eq!(event.timestamp.normal(), "1463745600.12345");
    }

    #[test]
    fn test_no_opt_in_header_skips() {
        let request = put(headers(&[("x-storage-policy", "sof")]), "cat.jpg");
        assert_eq!(
            filter().evaluate(&request),
            Decision::Skip(SkipReason::NotOptedIn)
        );
    }

    #[test]
    fn test_text_object_skips() {
        assert_eq!(
            filter().evaluate(&put(opted_in(), "notes.txt")),
            Decision::Skip(SkipReason::NotAnImage(Some("txt".to_string())))
        );
        assert_eq!(
            filter().evaluate(&put(opted_in(), "README")),
            Decision::Skip(SkipReason::NotAnImage(None))
        );
    }

    #[test]
    fn test_extension_match_is_case_sensitive() {
        assert!(matches!(
            filter().evaluate(&put(opted_in(), "CAT.JPG")),
            Decision::Skip(SkipReason::NotAnImage(_))
        ));
    }

    #[test]
    fn test_only_put_is_eligible() {
        let request = WriteRequest::new(Method::POST, opted_in(), "AUTH_test", "photos", "cat.jpg");
        assert_eq!(
            filter().evaluate(&request),
            Decision::Skip(SkipReason::MethodNotEligible(Method::POST))
        );
    }

    #[test]
    fn test_policy_gates() {
        // Default policy is not file-accessible
        let request = put(headers(&[("x-visual-insights-enable", "")]), "cat.jpg");
        assert_eq!(
            filter().evaluate(&request),
            Decision::Skip(SkipReason::PolicyNotFileAccessible(0))
        );

        let request = put(
            headers(&[("x-visual-insights-enable", "1"), ("x-storage-policy", "legacy")]),
            "cat.jpg",
        );
        assert!(matches!(
            filter().evaluate(&request),
            Decision::Skip(SkipReason::PolicyUnresolved(PolicyError::DeprecatedPolicy(_)))
        ));

        let request = put(
            headers(&[("x-visual-insights-enable", "1"), ("x-storage-policy", "nope")]),
            "cat.jpg",
        );
        assert!(matches!(
            filter().evaluate(&request),
            Decision::Skip(SkipReason::PolicyUnresolved(PolicyError::InvalidPolicy(_)))
        ));
    }

    #[test]
    fn test_empty_components_skip() {
        let request = WriteRequest::new(Method::PUT, opted_in(), "AUTH_test", "", "cat.jpg");
        assert_eq!(
            filter().evaluate(&request),
            Decision::Skip(SkipReason::IncompletePath)
        );
    }

    #[test]
    fn test_missing_timestamp_uses_epoch() {
        let request = put(
            headers(&[("x-visual-insights-enable", "1"), ("x-storage-policy", "sof")]),
            "cat.png",
        );
        let Decision::Publish(event) = filter().evaluate(&request) else {
            panic!("expected publish");
        };
        assert_eq!(event.timestamp, Timestamp::EPOCH);
        assert_eq!(event.timestamp.normal(), "0000000000.00000");
    }

    #[test]
    fn test_request_path_parsing() {
        let request =
            WriteRequest::from_path(Method::PUT, HeaderMap::new(), "/v1/AUTH_test/my%20photos/a/b%2Fc.jpg")
                .unwrap();
        assert_eq!(request.account, "AUTH_test");
        assert_eq!(request.container, "my photos");
        assert_eq!(request.object, "a/b/c.jpg");

        let request = WriteRequest::from_path(Method::PUT, HeaderMap::new(), "/v1/AUTH_test").unwrap();
        assert_eq!(request.container, "");
        assert_eq!(request.object, "");

        assert!(WriteRequest::from_path(Method::PUT, HeaderMap::new(), "/").is_none());
        assert!(WriteRequest::from_path(Method::PUT, HeaderMap::new(), "/v1").is_none());
    }

    #[test]
    fn test_percent_decode_keeps_malformed_escapes() {
        assert_eq!(percent_decode("100%").as_deref(), Some("100%"));
        assert_eq!(percent_decode("%zz.jpg").as_deref(), Some("%zz.jpg"));
        assert_eq!(percent_decode("%41").as_deref(), Some("A"));
    }

    #[test]
    fn test_undecodable_path_is_not_a_write() {
        assert_eq!(percent_decode("caf%C3%A9.jpg").as_deref(), Some("caf\u{e9}.jpg"));
        assert_eq!(percent_decode("bad%FF.jpg"), None);
        assert!(
            WriteRequest::from_path(Method::PUT, opted_in(), "/v1/AUTH_test/photos/bad%FF.jpg").is_none()
        );
    }
}
