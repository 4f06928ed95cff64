use crate::license::LicenseData;
use crate::secret_string::SecretString;
use crate::state::AppState;
use anyhow::Context;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_ORIGIN};
use axum::http::{HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tracing::{error, info};

pub static PLATFORM_LICENSE_EXCHANGE_PATH: &str = "/api/v1/license/platform/exchange";
static CORS_ALLOWED_HEADERS: &str = "content-type, origin, accept, authorization";
static LICENSE_DATA_FIELD: &str = "licenseData";

fn cors_headers() -> [(HeaderName, &'static str); 2] {
    [
        (ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (ACCESS_CONTROL_ALLOW_HEADERS, CORS_ALLOWED_HEADERS),
    ]
}

pub async fn readiness_probe(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_console_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn exchange_preflight() -> impl IntoResponse {
    (cors_headers(), StatusCode::OK)
}

/// Reads the platform license from the first JSON value in `body`.
///
/// The key matches case-insensitively, exact case first. A missing or null
/// `licenseData` and a top-level `null` both mean an empty license. Bytes after
/// the first value are ignored. An empty body, invalid JSON, or a non-string
/// license is an error.
fn decode_exchange_request(body: &[u8]) -> anyhow::Result<SecretString> {
    let Some(value) = serde_json::Deserializer::from_slice(body)
        .into_iter::<Value>()
        .next()
    else {
        anyhow::bail!("Request body is empty");
    };
    let fields = match value.context("Request body is not valid JSON")? {
        Value::Null => return Ok(SecretString::default()),
        Value::Object(fields) => fields,
        _ => anyhow::bail!("Request body is not a JSON object"),
    };

    let license_data = fields.get(LICENSE_DATA_FIELD).or_else(|| {
        fields
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(LICENSE_DATA_FIELD))
            .map(|(_, value)| value)
    });

    match license_data {
        None | Some(Value::Null) => Ok(SecretString::default()),
        Some(Value::String(license)) => Ok(SecretString::new(license.as_str())),
        Some(_) => anyhow::bail!("{} is not a string", LICENSE_DATA_FIELD),
    }
}

/// Exchanges a platform license for the application license.
/// Failures are reported by status code only, with an empty body.
pub async fn exchange_platform_license(State(state): State<AppState>, body: Bytes) -> Response {
    let platform_license = match decode_exchange_request(&body) {
        Ok(platform_license) => platform_license,
        Err(e) => {
            error!("Failed to decode platform license exchange request: {:#}", e);
            return (cors_headers(), StatusCode::BAD_REQUEST).into_response();
        }
    };

    match state.license_exchanger.exchange(&platform_license).await {
        Ok(license_data) => {
            info!("Exchanged platform license");
            (cors_headers(), Json(LicenseData { license_data })).into_response()
        }
        Err(e) => {
            error!("Failed to exchange platform license: {:#}", e);
            (cors_headers(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        // Methods other than OPTIONS are all treated as an exchange request.
        .route(
            PLATFORM_LICENSE_EXCHANGE_PATH,
            post(exchange_platform_license)
                .options(exchange_preflight)
                .fallback(exchange_platform_license),
        )
        .with_state(state)
}
