//! The range-aware download endpoint.

use std::error::Error;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use axum::{Router, routing};
use blockrelay_service::Locator;
use blockrelay_service::range::{ByteRange, RangePlan, RangeSpec};
use futures_util::TryStreamExt;

use crate::error::{ApiError, ApiResult};
use crate::state::ServiceState;

/// Media type used when neither the registry nor the file name suggest one.
const FALLBACK_MEDIA_TYPE: &str = "application/octet-stream";

/// Creates the router for `/dl/{object_ref}/{display_name}`.
pub fn router() -> Router<ServiceState> {
    Router::new().route(
        "/dl/{object_ref}/{display_name}",
        routing::get(download_get).head(download_head),
    )
}

/// A download whose headers are known but whose body has not been started.
#[derive(Debug)]
struct Download {
    locator: Locator,
    plan: RangePlan,
    status: StatusCode,
    headers: HeaderMap,
}

async fn download_get(
    State(state): State<ServiceState>,
    Path((object_ref, display_name)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let download = prepare(&state, &object_ref, &display_name, &headers).await?;
    let worker = state.pool.select().ok_or(ApiError::Unavailable)?;
    tracing::debug!(worker = %worker.id(), locator = ?download.locator, "relaying download");

    let stream = worker
        .relay()
        .stream(download.locator, download.plan)
        .inspect_err(|error| {
            merni::counter!("download.aborted": 1);
            tracing::warn!(error = error as &dyn Error, "download cut short");
        });

    respond(download.status, download.headers, Body::from_stream(stream))
}

async fn download_head(
    State(state): State<ServiceState>,
    Path((object_ref, display_name)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let download = prepare(&state, &object_ref, &display_name, &headers).await?;
    // HEAD must agree with GET on availability, even though it never streams.
    if state.pool.is_empty() {
        return Err(ApiError::Unavailable);
    }
    respond(download.status, download.headers, Body::empty())
}

/// Resolves the object and computes the response headers and block plan.
async fn prepare(
    state: &ServiceState,
    object_ref: &str,
    display_name: &str,
    request_headers: &HeaderMap,
) -> ApiResult<Download> {
    let locator = state
        .registry
        .resolve(object_ref)
        .await
        .map_err(ApiError::NotFound)?;
    let descriptor = state
        .registry
        .describe(&locator)
        .await
        .map_err(ApiError::NotFound)?;
    let size = descriptor.size;

    // Malformed or multi-range headers are served as full responses.
    let requested = request_headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(RangeSpec::parse);

    let (status, range) = match requested {
        Some(spec) => {
            let range = spec
                .resolve(size)
                .map_err(|e| ApiError::RangeNotSatisfiable { size: e.size })?;
            (StatusCode::PARTIAL_CONTENT, Some(range))
        }
        None => (StatusCode::OK, ByteRange::full(size)),
    };

    let block_size = state.pool.options().block_size;
    let plan = match range {
        Some(range) => RangePlan::new(range, block_size),
        None => RangePlan::empty(block_size),
    };

    let name = descriptor.name.as_deref().unwrap_or(display_name);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        content_type(descriptor.media_type.as_deref(), name),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(range.map_or(0, |r| r.len())),
    );
    if let Some(range) = range.filter(|_| status == StatusCode::PARTIAL_CONTENT) {
        headers.insert(header::CONTENT_RANGE, header_value(&range.content_range(size))?);
    }
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&format!("inline; filename=\"{}\"", sanitize_filename(name)))?,
    );

    Ok(Download {
        locator,
        plan,
        status,
        headers,
    })
}

fn respond(status: StatusCode, headers: HeaderMap, body: Body) -> ApiResult<Response> {
    let mut response = Response::builder()
        .status(status)
        .body(body)
        .map_err(|e| ApiError::Server(Box::new(e)))?;
    response.headers_mut().extend(headers);
    Ok(response)
}

fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ApiError::Server(Box::new(e)))
}

/// Picks the declared media type, falling back to a guess from the file name.
fn content_type(declared: Option<&str>, name: &str) -> HeaderValue {
    declared
        .and_then(|media_type| HeaderValue::from_str(media_type).ok())
        .unwrap_or_else(|| {
            let guessed = mime_guess::from_path(name)
                .first_raw()
                .unwrap_or(FALLBACK_MEDIA_TYPE);
            HeaderValue::from_static(guessed)
        })
}

/// Restricts a file name to characters that are safe inside a quoted header parameter.
fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect();

    if sanitized.trim_matches(['.', '_']).is_empty() {
        "download".to_owned()
    } else {
        sanitized
    }
}
