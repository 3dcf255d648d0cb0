use std::fmt;

/// Identifies one cached resource.
///
/// A key is an ordered, non-empty list of segments. The first segment is the
/// namespace of the subsystem that owns the entry, so several subsystems can
/// share one store without touching each other's keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(Vec<String>);

impl CacheKey {
    pub fn new<I, S>(namespace: impl Into<String>, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut segments = vec![namespace.into()];
        segments.extend(parts.into_iter().map(Into::into));
        Self(segments)
    }

    /// Key for a request: `[namespace, url]` for GET, `[namespace, METHOD, url]`
    /// for anything else.
    pub fn for_request(namespace: impl Into<String>, request: &ResourceRequest) -> Self {
        if request.method.eq_ignore_ascii_case("GET") {
            Self::new(namespace, [request.url.as_str()])
        } else {
            Self::new(
                namespace,
                [request.method.to_ascii_uppercase(), request.url.clone()],
            )
        }
    }

    pub fn namespace(&self) -> &str {
        &self.0[0]
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

/// Renders the key as a JSON array. Quoting every segment keeps distinct keys
/// distinct even when a segment contains the separator.
impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", serde_json::Value::from(segment.as_str()))?;
        }
        f.write_str("]")
    }
}

/// Outbound request description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
}

impl ResourceRequest {
    /// A GET expecting a JSON document back.
    pub fn get_json(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: vec![("Accept".to_string(), "application/json".to_string())],
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}
