use axum::body::Bytes;
use axum::extract::{Multipart, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::episode::{dispatch_processing, parse_destination};
use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::catalog::ConversionStatus;
use crate::processing::ProcessingJob;

pub(super) async fn put_chunk(
    State(ctx): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut data: Option<Bytes> = None;
    let mut chunk_index: Option<u32> = None;
    let mut total_chunks: Option<u32> = None;
    let mut filename: Option<String> = None;
    let mut upload_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let part_name = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.to_string()))?;
                if filename.is_none() {
                    filename = part_name;
                }
                data = Some(bytes);
            }
            "chunkIndex" => chunk_index = Some(parse_number(&name, field.text().await)?),
            "totalChunks" => total_chunks = Some(parse_number(&name, field.text().await)?),
            "filename" => filename = Some(text_field(field.text().await)?),
            "uploadId" => upload_id = Some(text_field(field.text().await)?),
            _ => {}
        }
    }

    let data = data.ok_or_else(|| missing("file"))?;
    let chunk_index = chunk_index.ok_or_else(|| missing("chunkIndex"))?;
    let total_chunks = total_chunks.ok_or_else(|| missing("totalChunks"))?;
    let upload_id = upload_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| missing("uploadId"))?;
    let filename = filename
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| missing("filename"))?;

    let receipt = ctx
        .uploads
        .put_chunk(&upload_id, chunk_index, total_chunks, &filename, &data)
        .await?;
    Ok(Json(json!({
        "success": true,
        "chunkIndex": chunk_index,
        "received": receipt.received,
        "total": receipt.total,
        "complete": receipt.complete,
    })))
}

#[derive(Debug, Deserialize)]
pub(super) struct CompleteRequest {
    #[serde(rename = "uploadId")]
    upload_id: String,
    #[serde(default)]
    destination: Option<String>,
}

pub(super) async fn complete(
    State(ctx): State<AppState>,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<Json<Value>> {
    let destination = match request.destination.as_deref().filter(|d| !d.trim().is_empty()) {
        Some(raw) => {
            let (show_id, episode_id) = parse_destination(raw)?;
            // Fail before the session is consumed.
            ctx.catalog.load_episode(&show_id, &episode_id).await?;
            let claim = ctx.catalog.try_claim_audio(&show_id, &episode_id)?;
            Some((show_id, episode_id, claim))
        }
        None => None,
    };

    let assembled = ctx.uploads.assemble(&request.upload_id).await?;
    let mut body = json!({
        "success": true,
        "tempFile": assembled.path.display().to_string(),
        "filename": assembled.filename,
        "hash": assembled.hash,
        "size": assembled.size_bytes,
    });

    if let Some((show_id, episode_id, claim)) = destination {
        let attached = ctx
            .catalog
            .attach_audio(&show_id, &episode_id, &assembled.path, &assembled.filename)
            .await;
        drop(claim);
        let target = match attached {
            Ok(target) => target,
            Err(err) => {
                match tokio::fs::remove_file(&assembled.path).await {
                    Ok(()) => {}
                    Err(remove_err) if remove_err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(remove_err) => {
                        warn!(file = %assembled.path.display(), error = %remove_err, "could not discard assembled upload");
                    }
                }
                return Err(err.into());
            }
        };
        info!(show = %show_id, episode = %episode_id, upload = %request.upload_id, "upload attached to episode");
        let job = ProcessingJob::new(&show_id, &episode_id).with_source(target.clone());
        dispatch_processing(&ctx, job).await?;
        body["tempFile"] = json!(target.display().to_string());
        body["episode"] = json!(episode_id);
        body["conversionStatus"] = json!(ConversionStatus::Processing.as_str());
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub(super) struct StatusQuery {
    #[serde(rename = "uploadId", default)]
    upload_id: Option<String>,
}

pub(super) async fn status(
    State(ctx): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<Value>> {
    let upload_id = query
        .upload_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| missing("uploadId"))?;
    let status = ctx.uploads.status(&upload_id).await?;
    Ok(Json(json!({
        "upload_id": status.upload_id,
        "filename": status.filename,
        "received": status.received,
        "total": status.total,
        "percent": status.percent_complete,
        "complete": status.complete,
        "duration": status.elapsed_seconds,
        "age_seconds": status.age_seconds,
        "created_at": status.created_at.to_rfc3339(),
        "last_update": status.last_update.to_rfc3339(),
    })))
}

pub(super) async fn cleanup(State(ctx): State<AppState>) -> ApiResult<Json<Value>> {
    let report = ctx.uploads.cleanup(ctx.session_ttl()).await?;
    Ok(Json(json!({
        "success": true,
        "cleaned": report.deleted,
        "skipped": report.skipped,
        "failed": report.failed,
        "results": report.results,
        "assembledRemoved": report.assembled_removed,
    })))
}

fn missing(field: &str) -> ApiError {
    ApiError::BadRequest(format!("missing field {field}"))
}

fn text_field<E: std::fmt::Display>(value: Result<String, E>) -> ApiResult<String> {
    value
        .map(|text| text.trim().to_string())
        .map_err(|err| ApiError::BadRequest(err.to_string()))
}

fn parse_number<E: std::fmt::Display>(name: &str, value: Result<String, E>) -> ApiResult<u32> {
    let text = text_field(value)?;
    text.parse()
        .map_err(|_| ApiError::BadRequest(format!("field {name} must be a non-negative integer, got {text:?}")))
}
