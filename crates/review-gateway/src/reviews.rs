use crate::error::GatewayError;
use crate::gateway::{FetchSource, Gateway, Validator};
use gateway_cache::{CachePolicy, ResourceRequest};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Namespace for widget documents in the shared store.
pub const REVIEWS_NAMESPACE: &str = "featurable-widget";

/// Which widget bodies are allowed into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    /// Any JSON object or array (anything but null and scalars).
    #[default]
    NonNullObject,
    /// An object whose `data.widget.reviews` is an array.
    ReviewsArray,
}

impl Validity {
    pub fn check(&self, body: &Value) -> bool {
        match self {
            Validity::NonNullObject => body.is_object() || body.is_array(),
            Validity::ReviewsArray => body
                .pointer("/data/widget/reviews")
                .is_some_and(Value::is_array),
        }
    }

    pub fn validator(self) -> Validator {
        Arc::new(move |body: &Value| self.check(body))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Star rating. Widgets send whole and half stars.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Rating {
    #[serde(default)]
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    #[serde(default, deserialize_with = "lenient")]
    pub author: Option<Author>,
    #[serde(default, deserialize_with = "lenient")]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub rating: Option<Rating>,
    #[serde(default, deserialize_with = "lenient")]
    pub published_at: Option<String>,
}

/// A field of the wrong shape decodes as absent instead of dropping the review.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).ok())
}

/// Widget document as returned by the gateway.
#[derive(Debug, Clone)]
pub struct Reviews {
    pub data: Arc<Value>,
    /// `None` when nothing was fetched.
    pub source: Option<FetchSource>,
    pub fetched_at: Option<Instant>,
}

impl Reviews {
    /// Rendered when nothing could be fetched.
    pub fn empty() -> Self {
        Self {
            data: Arc::new(Value::Null),
            source: None,
            fetched_at: None,
        }
    }

    /// Time since the document left the upstream.
    pub fn age(&self) -> Option<Duration> {
        self.fetched_at.map(|at| at.elapsed())
    }

    /// Reviews in `data.widget.reviews`. Items that do not decode are
    /// skipped; a body of any other shape yields no reviews.
    pub fn reviews(&self) -> Vec<Review> {
        self.data
            .pointer("/data/widget/reviews")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| Review::deserialize(item).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Per-request handle for the review widget.
///
/// Cheap to build: it borrows the process-wide gateway and only carries the
/// endpoint and validity check.
#[derive(Clone)]
pub struct ReviewsClient {
    gateway: Gateway,
    endpoint: String,
    validator: Validator,
}

impl ReviewsClient {
    pub fn new(
        gateway: Gateway,
        endpoint: impl Into<String>,
        validity: Validity,
    ) -> Result<Self, GatewayError> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(GatewayError::Configuration(
                "review widget endpoint URL is not set (FEATURABLE_URL or [upstream].url)".into(),
            ));
        }
        Ok(Self {
            gateway,
            endpoint,
            validator: validity.validator(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Fetch the widget document through the cache.
    pub async fn get_reviews(
        &self,
        policy: &CachePolicy,
        cancel: &CancellationToken,
    ) -> Result<Reviews, GatewayError> {
        let request = ResourceRequest::get_json(&self.endpoint);
        let key = self.gateway.key_for(&request);
        let fetched = self
            .gateway
            .get_resource(key, &request, policy, &self.validator, cancel)
            .await?;

        Ok(Reviews {
            data: fetched.body,
            source: Some(fetched.source),
            fetched_at: Some(fetched.fetched_at),
        })
    }
}
