pub mod config;
pub mod error;
pub mod gateway;
pub mod reviews;
pub mod server;

pub use error::GatewayError;
pub use gateway::{FetchSource, Fetched, Gateway, GatewaySettings, SkipReason, Validator};
pub use reviews::{Review, Reviews, ReviewsClient, Validity};
