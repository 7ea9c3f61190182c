//! Shared reqwest plumbing for the HTTP backends

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::VendorError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a client that trusts `ca_bundle` in addition to the webpki roots.
pub(crate) fn build_client(ca_bundle: Option<&[u8]>) -> Result<Client, VendorError> {
    let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
    if let Some(pem) = ca_bundle {
        let certificate = reqwest::Certificate::from_pem(pem)
            .map_err(|e| VendorError::new("invalid_ca_bundle", e.to_string()))?;
        builder = builder.add_root_certificate(certificate);
    }
    builder.build().map_err(|e| VendorError::transport(format!("Failed to build HTTP client: {}", e)))
}

pub(crate) fn send_error(e: reqwest::Error) -> VendorError {
    VendorError::transport(e.to_string())
}

/// Check the status and decode a JSON body.
pub(crate) async fn json_response<T: DeserializeOwned>(response: Response) -> Result<T, VendorError> {
    let status = response.status();
    debug!(status = %status, url = %response.url().path(), "Response status");

    if !status.is_success() {
        let error_text =
            response.text().await.unwrap_or_else(|_| "<unable to read error>".to_string());
        trace!("Error response:\n{}", error_text);
        return Err(VendorError::http(status.as_u16(), error_text));
    }

    let body = response.text().await.map_err(send_error)?;
    serde_json::from_str(&body)
        .map_err(|e| VendorError::transport(format!("Failed to deserialize response: {}", e)))
}

/// Join a base URL and a path without doubling the slash.
pub(crate) fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
