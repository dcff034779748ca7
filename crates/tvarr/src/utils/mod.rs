pub mod circuit_breaker;
pub mod cron;
pub mod http_client;
pub mod human_format;
pub mod secrets;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager};
pub use http_client::{FetchedBody, HttpClientConfig, UpstreamHttpClient};
pub use secrets::CredentialVault;
