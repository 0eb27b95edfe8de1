use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::catalog::{validate_id, NewEpisode};
use crate::context::PublisherContext;
use crate::processing::{ProcessingError, ProcessingJob, QueueStats};

pub(super) async fn episode_info(
    State(ctx): State<AppState>,
    Path((show_id, episode_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let metadata = ctx.catalog.load_episode(&show_id, &episode_id).await?;
    Ok(Json(json!({
        "title": metadata.title.as_deref().unwrap_or("Untitled"),
        "audio_url": metadata.audio.as_deref().unwrap_or_default(),
        "conversion_status": metadata.status().as_str(),
        "conversion_error": metadata.conversion_error,
        "filename": metadata.audio_file_name().unwrap_or_default(),
        "bitrate": metadata.bitrate,
        "channels": metadata.channels,
        "duration": metadata.duration,
        "duration_seconds": metadata.duration_seconds,
        "samplerate": metadata.samplerate,
        "size": metadata.size,
        "size_bytes": metadata.size_bytes,
    })))
}

pub(super) async fn create_episode(
    State(ctx): State<AppState>,
    Path(show_id): Path<String>,
    Json(draft): Json<NewEpisode>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if draft.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".into()));
    }
    let (episode_id, metadata) = ctx.catalog.create_episode(&show_id, &draft).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "episode": episode_id,
            "metadata": metadata,
        })),
    ))
}

/// Re-queues an episode whose audio is already in place.
///
/// Answers 409 while a job is working on the episode's audio.
pub(super) async fn process_episode(
    State(ctx): State<AppState>,
    Path((show_id, episode_id)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let claim = ctx.catalog.try_claim_audio(&show_id, &episode_id)?;
    let source = {
        let _guard = ctx.catalog.lock_episode(&show_id, &episode_id).await;
        let mut metadata = ctx.catalog.load_episode(&show_id, &episode_id).await?;
        let source = ctx
            .catalog
            .locate_audio(&show_id, &episode_id, &metadata)
            .await?
            .ok_or_else(|| ProcessingError::MissingAudio {
                show_id: show_id.clone(),
                episode_id: episode_id.clone(),
            })?;
        metadata.mark_processing();
        ctx.catalog.save_episode(&show_id, &episode_id, &metadata).await?;
        source
    };
    drop(claim);

    let job = ProcessingJob::new(&show_id, &episode_id).with_source(source);
    dispatch_processing(&ctx, job).await?;
    info!(show = %show_id, episode = %episode_id, "processing requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "episode": episode_id,
            "conversionStatus": "processing",
        })),
    ))
}

pub(super) async fn processing_stats(State(ctx): State<AppState>) -> Json<QueueStats> {
    Json(ctx.queue.stats())
}

/// Hands a job to the queue.
///
/// The episode must already be `processing`. When the queue refuses the job
/// the record is moved to `failed` so it never stays `processing` without a
/// worker behind it.
pub(super) async fn dispatch_processing(
    ctx: &PublisherContext,
    job: ProcessingJob,
) -> ApiResult<()> {
    let Err(err) = ctx.queue.try_dispatch(job.clone()) else {
        return Ok(());
    };
    warn!(show = %job.show_id, episode = %job.episode_id, error = %err, "processing not queued");
    let _guard = ctx.catalog.lock_episode(&job.show_id, &job.episode_id).await;
    match ctx.catalog.load_episode(&job.show_id, &job.episode_id).await {
        Ok(mut metadata) => {
            metadata.mark_failed(format!("not queued: {err}"));
            if let Err(save_err) = ctx
                .catalog
                .save_episode(&job.show_id, &job.episode_id, &metadata)
                .await
            {
                warn!(show = %job.show_id, episode = %job.episode_id, error = %save_err, "could not record dispatch failure");
            }
        }
        Err(load_err) => {
            warn!(show = %job.show_id, episode = %job.episode_id, error = %load_err, "could not record dispatch failure");
        }
    }
    Err(err.into())
}

/// Splits a `show/episode` upload destination.
pub(super) fn parse_destination(raw: &str) -> ApiResult<(String, String)> {
    let trimmed = raw.trim().trim_matches('/');
    let (show_id, episode_id) = trimmed
        .split_once('/')
        .ok_or_else(|| ApiError::BadRequest(format!("destination must be show/episode, got {raw:?}")))?;
    validate_id(show_id)?;
    validate_id(episode_id)?;
    Ok((show_id.to_string(), episode_id.to_string()))
}

pub(super) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_is_split_and_validated() {
        let (show, episode) = parse_destination("/morning/ab12cd34/").unwrap();
        assert_eq!(show, "morning");
        assert_eq!(episode, "ab12cd34");
        assert!(parse_destination("morning").is_err());
        assert!(parse_destination("morning/../etc").is_err());
    }
}
