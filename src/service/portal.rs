//! Captive-portal probing.
//!
//! Probes a handful of well-known endpoints whose expected responses are
//! fixed. A redirect, a tampered body, or a wrong status code all mean
//! something between us and the internet is intercepting HTTP.

use std::time::Duration;

use log::debug;
use reqwest::redirect::Policy;

const PROBE_ENDPOINTS: &[&str] = &[
    "http://detectportal.firefox.com/success.txt",
    "http://www.gstatic.com/generate_204",
    "http://captive.apple.com/hotspot-detect.html",
];

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Probes for a captive portal. Returns whether one was detected and the
/// URL to open when it was (the redirect target, or the probe endpoint
/// when interception was inferred from the response body).
pub async fn check_captive_portal() -> (bool, String) {
    let client = match reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .redirect(Policy::none())
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            debug!("portal probe client build failed: {e}");
            return (false, String::new());
        }
    };

    for endpoint in PROBE_ENDPOINTS {
        let response = match client.get(*endpoint).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("portal probe {endpoint} failed: {e}");
                continue;
            }
        };

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|value| value.to_str().ok())
                .unwrap_or(endpoint)
                .to_string();
            return (true, location);
        }

        if endpoint.contains("firefox") {
            let body = response.text().await.unwrap_or_default();
            if !body.contains("success") {
                return (true, (*endpoint).to_string());
            }
        } else if endpoint.contains("generate_204") && status.as_u16() != 204 {
            return (true, (*endpoint).to_string());
        }

        // Expected response from a reachable probe: no portal.
        return (false, String::new());
    }

    (false, String::new())
}
