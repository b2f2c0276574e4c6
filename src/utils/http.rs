use once_cell::sync::Lazy;
use reqwest::Client;

/// Global shared HTTP client for short calls (60s timeout)
pub static SHARED_CLIENT: Lazy<Client> = Lazy::new(|| create_base_client(Some(60)));

/// Global shared HTTP client for upstream model calls.
/// No overall timeout — streamed completions can legitimately run for minutes;
/// only the connect phase is bounded.
pub static UPSTREAM_CLIENT: Lazy<Client> = Lazy::new(|| create_base_client(None));

/// Base client creation logic
fn create_base_client(timeout_secs: Option<u64>) -> Client {
    let mut builder = Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30));

    if let Some(secs) = timeout_secs {
        builder = builder.timeout(std::time::Duration::from_secs(secs));
    }

    tracing::info!("Initialized HTTP client (timeout={:?}s)", timeout_secs);
    builder.build().unwrap_or_else(|_| Client::new())
}

/// Get uniformly configured HTTP client (60s timeout)
pub fn get_client() -> Client {
    SHARED_CLIENT.clone()
}

/// Get the unbounded client used for proxied upstream calls
pub fn get_upstream_client() -> Client {
    UPSTREAM_CLIENT.clone()
}
