use std::{sync::OnceLock, time::Duration};

use tracing::debug;

/// User agent sent by every outbound channel request.
pub const USER_AGENT: &str = concat!("notify-dispatch/", env!("CARGO_PKG_VERSION"));

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the HTTP client shared by all HTTP-based channels.
///
/// No overall request timeout is set here: each channel applies its own
/// per-request timeout.
pub fn build_channel_client(connect_timeout: Duration) -> crate::Result<reqwest::Client> {
    install_rustls_provider();

    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(8)
        .build()
        .map_err(|e| crate::Error::Other(format!("Failed to build HTTP client: {}", e)))
}
