//! HTTP surface: chunked uploads, episode records, processing and feeds.

mod episode;
mod error;
mod feed;
mod upload;

use std::future::Future;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

pub use error::{ApiError, ApiResult};

use crate::context::PublisherContext;

pub(crate) type AppState = Arc<PublisherContext>;

/// Room for the multipart framing around one chunk.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

pub fn router(ctx: Arc<PublisherContext>) -> Router {
    let chunk_limit = ctx.config.upload.max_chunk_bytes + MULTIPART_OVERHEAD_BYTES;
    Router::new()
        .route(
            "/api/upload/chunk",
            post(upload::put_chunk).layer(DefaultBodyLimit::max(chunk_limit)),
        )
        .route("/api/upload/complete", post(upload::complete))
        .route("/api/upload/status", get(upload::status))
        .route("/api/upload/cleanup", post(upload::cleanup))
        .route("/api/episode_info/:show_id/:episode_id", get(episode::episode_info))
        .route("/api/shows/:show_id/episodes", post(episode::create_episode))
        .route(
            "/api/shows/:show_id/episodes/:episode_id/process",
            post(episode::process_episode),
        )
        .route("/api/processing", get(episode::processing_stats))
        .route("/shows/:show_id/feed.xml", get(feed::show_feed))
        .route("/health", get(episode::health))
        .with_state(ctx)
}

/// Serves until `shutdown` resolves, then drains the processing queue.
pub async fn serve<F>(
    ctx: Arc<PublisherContext>,
    listener: TcpListener,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "publisher listening");
    }
    let app = router(Arc::clone(&ctx));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    ctx.shutdown().await;
    info!("publisher stopped");
    Ok(())
}
