//! Shared HTTP client construction.

use std::time::Duration;

/// Create the HTTP client used by every provider.
///
/// Config: 30s connect timeout, rustls TLS, `ember/{version}` user-agent, redirect
/// limit 10. No overall request timeout: streamed completions are bounded by the
/// agent's turn deadline instead.
#[must_use]
pub fn default_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .user_agent(concat!("ember/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .expect("default HTTP client construction must not fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_client_builds() {
        let _client = default_client();
    }
}
