use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use url::Url;

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::context::PublisherContext;

const RSS_CONTENT_TYPE: &str = "application/rss+xml; charset=utf-8";

pub(super) async fn show_feed(
    State(ctx): State<AppState>,
    Path(show_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let base_url = request_base_url(&ctx, &headers)?;
    let document = ctx.feed.render(&show_id, &base_url).await?;

    let if_none_match = header_str(&headers, header::IF_NONE_MATCH);
    let if_modified_since = header_str(&headers, header::IF_MODIFIED_SINCE);
    let validators = [
        (header::ETAG, document.etag.clone()),
        (header::LAST_MODIFIED, document.last_modified_header()),
        (header::CACHE_CONTROL, ctx.config.server.feed_cache_control.clone()),
    ];
    if document.is_not_modified(if_none_match, if_modified_since) {
        return Ok((StatusCode::NOT_MODIFIED, validators).into_response());
    }
    Ok((
        [(header::CONTENT_TYPE, RSS_CONTENT_TYPE.to_string())],
        validators,
        document.xml,
    )
        .into_response())
}

/// Public base URL: the configured one, else derived from the request.
fn request_base_url(ctx: &PublisherContext, headers: &HeaderMap) -> ApiResult<Url> {
    let configured = ctx
        .config
        .server
        .public_base_url()
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    if let Some(url) = configured {
        return Ok(url);
    }
    let host = header_str(headers, header::HOST)
        .filter(|host| !host.is_empty())
        .unwrap_or("localhost");
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .filter(|proto| matches!(*proto, "http" | "https"))
        .unwrap_or("http");
    Url::parse(&format!("{scheme}://{host}/"))
        .map_err(|_| ApiError::BadRequest(format!("invalid Host header {host:?}")))
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
