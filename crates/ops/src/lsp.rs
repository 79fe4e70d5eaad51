//! Local source proxy health.
//!
//! The proxy call is classified in two layers: the API server's status for the
//! proxy request itself, then (only on 2xx) the status the proxy reports for
//! its upstream registry. Non-2xx answers become a [`HealthStatus`], not errors.

use std::num::ParseIntError;

use http::{Request, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use apps_core::HealthStatus;

use crate::proxy::{has_valid_escapes, ProxyError, Transport, Wrapper};

pub const HEALTH_PATH: &str = "health";

const ALL_CHECKS_PASSED: &str = "All health checks passed";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LspResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub statuscode: String,
}

impl LspResponse {
    /// The message with URL escapes decoded; the raw message if it is not valid escaping.
    pub fn decoded_message(&self) -> String {
        let plus_decoded = self.message.replace('+', " ");
        if !has_valid_escapes(&plus_decoded) {
            return self.message.clone();
        }
        match urlencoding::decode(&plus_decoded) {
            Ok(m) => m.into_owned(),
            Err(_) => self.message.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("unable to read local source proxy response: {0:?}")]
    MissingStatusCode(LspResponse),
    #[error("invalid local source proxy status code {code:?}: {source}")]
    InvalidStatusCode {
        code: String,
        #[source]
        source: ParseIntError,
    },
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Http(#[from] http::Error),
}

fn report(theme: &str, detail: &str) -> String {
    format!("{theme}\nMessages:\n- {detail}")
}

/// Query the proxy health endpoint; `transport` must be based on the health path.
pub async fn get_status(transport: &Wrapper) -> Result<HealthStatus, HealthError> {
    let req = Request::get(transport.url().path()).body(Vec::new())?;
    let resp = transport.round_trip(req).await?;
    let body = resp.body();
    let parsed = serde_json::from_slice::<LspResponse>(body).unwrap_or_else(|e| {
        debug!(error = %e, "health response is not JSON; using raw body as message");
        LspResponse { message: String::from_utf8_lossy(body).into_owned(), statuscode: String::new() }
    });
    debug!(status = %resp.status(), statuscode = %parsed.statuscode, "local source proxy health response");

    if let Some(s) = check_request_response_code(resp.status(), &parsed.decoded_message()) {
        return Ok(s);
    }
    status_from_lsp_response(&parsed)
}

/// Classify the API server status of the proxy call; `None` on 2xx.
pub fn check_request_response_code(status: StatusCode, msg: &str) -> Option<HealthStatus> {
    let code = status.as_u16();
    if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
        return Some(HealthStatus {
            message: report("The current user does not have permission to access the local source proxy.", msg),
            ..Default::default()
        });
    }
    if code >= 500 && status != StatusCode::SERVICE_UNAVAILABLE {
        return Some(HealthStatus {
            user_has_permission: true,
            reachable: true,
            message: report("Local source proxy is not healthy.", msg),
            ..Default::default()
        });
    }
    if status == StatusCode::SERVICE_UNAVAILABLE {
        return Some(HealthStatus {
            user_has_permission: true,
            message: report("Local source proxy is not healthy.", msg),
            ..Default::default()
        });
    }
    if code >= 400 && status != StatusCode::NOT_FOUND {
        return Some(HealthStatus {
            message: report("The request is not valid for the query the health of the local source proxy.", msg),
            ..Default::default()
        });
    }
    if status == StatusCode::NOT_FOUND {
        return Some(HealthStatus {
            user_has_permission: true,
            message: report("Local source proxy is not installed on the cluster.", msg),
            ..Default::default()
        });
    }
    if code >= 300 {
        return Some(HealthStatus {
            message: report("Local source proxy was moved and is not reachable in the defined url.", msg),
            ..Default::default()
        });
    }
    None
}

/// Classify the upstream status the proxy embeds in its response body.
pub fn status_from_lsp_response(r: &LspResponse) -> Result<HealthStatus, HealthError> {
    if r.statuscode.is_empty() {
        return Err(HealthError::MissingStatusCode(r.clone()));
    }
    let code: u16 = r
        .statuscode
        .trim()
        .parse()
        .map_err(|source| HealthError::InvalidStatusCode { code: r.statuscode.clone(), source })?;

    if (200..300).contains(&code) {
        return Ok(HealthStatus {
            user_has_permission: true,
            reachable: true,
            upstream_authenticated: true,
            overall_health: true,
            message: ALL_CHECKS_PASSED.to_string(),
        });
    }
    Ok(HealthStatus {
        user_has_permission: true,
        reachable: true,
        message: report(
            "Local source proxy was unable to authenticate against the target registry.",
            &r.decoded_message(),
        ),
        ..Default::default()
    })
}
