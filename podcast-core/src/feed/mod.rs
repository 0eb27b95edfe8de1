//! RSS 2.0 feed generation with iTunes and Podcasting 2.0 tags.

mod error;

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

pub use error::{FeedError, FeedResult};

use crate::catalog::{
    cdata_or_escape, escape_xml, explicit_label, has_extension, sanitize_html_for_rss, Catalog,
    CatalogError, EpisodeMetadata, ShowFeedConfig, EPISODE_METADATA_FILE, IMAGE_EXTENSIONS,
    SHOW_CONFIG_FILE,
};

/// UUID namespace used by the podcast namespace for `podcast:guid`.
pub const PODCAST_GUID_NAMESPACE: Uuid = Uuid::from_u128(0xead4c236_bf58_58c6_a2c6_a6b28d128cb6);

const LAST_BUILD_DATE_TAG: &str = "<lastBuildDate>";

/// Rendered feed plus its cache validators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedDocument {
    pub xml: String,
    /// Quoted strong validator.
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

impl FeedDocument {
    pub fn last_modified_header(&self) -> String {
        http_date(self.last_modified)
    }

    /// True when the request validators show the client copy is current.
    ///
    /// `If-None-Match` takes precedence over `If-Modified-Since`.
    pub fn is_not_modified(&self, if_none_match: Option<&str>, if_modified_since: Option<&str>) -> bool {
        if let Some(candidates) = if_none_match {
            let ours = strip_weak(&self.etag);
            return candidates
                .split(',')
                .map(str::trim)
                .any(|tag| tag == "*" || strip_weak(tag) == ours);
        }
        if let Some(since) = if_modified_since {
            if let Ok(since) = DateTime::parse_from_rfc2822(since.trim()) {
                return self.last_modified.timestamp() <= since.timestamp();
            }
        }
        false
    }
}

fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

/// An episode that made it into the feed, with everything read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEpisode {
    pub episode_id: String,
    pub metadata: EpisodeMetadata,
    pub audio_file: String,
    pub audio_length: u64,
    pub image_file: Option<String>,
    /// Latest mtime of the episode's audio, metadata and images.
    pub version: i64,
    pub directory_modified: DateTime<Utc>,
}

/// Inputs of [`render_feed`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeedInput {
    pub show_id: String,
    pub config: ShowFeedConfig,
    pub base_url: Url,
    /// Cover path relative to the show directory.
    pub cover_file: Option<String>,
    pub config_modified: i64,
    /// Unix mtimes of every readable episode metadata file, in listing order.
    pub metadata_modified: Vec<i64>,
    pub episodes: Vec<FeedEpisode>,
}

#[derive(Debug, Clone)]
pub struct FeedSynthesizer {
    catalog: Arc<Catalog>,
}

impl FeedSynthesizer {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    pub async fn render(&self, show_id: &str, base_url: &Url) -> FeedResult<FeedDocument> {
        let input = self.collect(show_id, base_url).await?;
        Ok(render_feed(&input, Utc::now()))
    }

    /// Reads the show and every publishable episode.
    ///
    /// Episodes with unreadable metadata, no recorded file or a missing
    /// audio file are left out.
    pub async fn collect(&self, show_id: &str, base_url: &Url) -> FeedResult<FeedInput> {
        let config = match self.catalog.load_show(show_id).await {
            Ok(config) => config,
            Err(CatalogError::ShowNotFound(_)) => return Err(FeedError::ShowNotFound(show_id.into())),
            Err(err) => return Err(err.into()),
        };
        let show_dir = self.catalog.show_dir(show_id)?;
        let config_modified = mtime(&show_dir.join(SHOW_CONFIG_FILE)).await.unwrap_or(0);
        let cover_file = self
            .catalog
            .find_show_cover(show_id, &config)
            .await?
            .and_then(|path| {
                path.strip_prefix(&show_dir)
                    .ok()
                    .map(|rel| rel.to_string_lossy().to_string())
            });

        let mut episodes = Vec::new();
        let mut metadata_modified = Vec::new();
        for episode_id in self.catalog.list_episode_ids(show_id).await? {
            let dir = match self.catalog.episode_dir(show_id, &episode_id) {
                Ok(dir) => dir,
                Err(err) => {
                    debug!(show = show_id, episode = %episode_id, error = %err, "skipping episode directory");
                    continue;
                }
            };
            let Some(meta_mtime) = mtime(&dir.join(EPISODE_METADATA_FILE)).await else {
                continue;
            };
            metadata_modified.push(meta_mtime);
            let metadata = match self.catalog.load_episode(show_id, &episode_id).await {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(show = show_id, episode = %episode_id, error = %err, "skipping unreadable episode");
                    continue;
                }
            };
            let Some(audio_file) = metadata
                .filename
                .clone()
                .filter(|name| !name.trim().is_empty())
            else {
                continue;
            };
            let audio_path = dir.join(&audio_file);
            let audio_meta = match fs::metadata(&audio_path).await {
                Ok(meta) if meta.is_file() => meta,
                _ => {
                    debug!(show = show_id, episode = %episode_id, file = %audio_file, "audio missing, skipping");
                    continue;
                }
            };
            let audio_mtime = audio_meta.modified().ok().map(unix_seconds).unwrap_or(0);
            let image_file = self
                .catalog
                .find_episode_cover(show_id, &episode_id, &metadata)
                .await?
                .and_then(|path| path.file_name().map(|n| n.to_string_lossy().to_string()));
            let version = audio_mtime
                .max(meta_mtime)
                .max(latest_image_mtime(&dir).await.unwrap_or(0));
            let directory_modified = fs::metadata(&dir)
                .await
                .ok()
                .and_then(|meta| meta.modified().ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(Utc::now);

            episodes.push(FeedEpisode {
                episode_id,
                metadata,
                audio_file,
                audio_length: audio_meta.len(),
                image_file,
                version,
                directory_modified,
            });
        }

        Ok(FeedInput {
            show_id: show_id.to_string(),
            config,
            base_url: base_url.clone(),
            cover_file,
            config_modified,
            metadata_modified,
            episodes,
        })
    }
}

/// Builds the XML document and its validators.
pub fn render_feed(input: &FeedInput, now: DateTime<Utc>) -> FeedDocument {
    let cfg = &input.config;
    let show_id = input.show_id.as_str();
    let base = &input.base_url;
    let title = cfg.title_or(show_id);
    let channel_link = asset_url(base, &["shows", show_id], None);
    let feed_url = asset_url(base, &["shows", show_id, "feed.xml"], None);
    let author = non_empty(cfg.author.as_deref());
    let description = non_empty(cfg.description.as_deref()).unwrap_or("");
    let summary = non_empty(cfg.summary.as_deref()).unwrap_or(description);
    let copyright = non_empty(cfg.copyright.as_deref())
        .map(str::to_string)
        .unwrap_or_else(|| format!("© {} {}", now.year(), author.unwrap_or(title)));
    let guid = non_empty(cfg.guid.as_deref())
        .map(str::to_string)
        .unwrap_or_else(|| podcast_guid(&feed_url).to_string());

    let mut xml = String::with_capacity(4096);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(
        "<rss version=\"2.0\" xmlns:itunes=\"http://www.itunes.com/dtds/podcast-1.0.dtd\" \
         xmlns:atom=\"http://www.w3.org/2005/Atom\" \
         xmlns:podcast=\"https://podcastindex.org/namespace/1.0\">\n",
    );
    xml.push_str("<channel>\n");
    push_line(&mut xml, 1, &format!("<title>{}</title>", cdata_or_escape(title)));
    push_line(&mut xml, 1, &format!("<link>{}</link>", escape_xml(&channel_link)));
    push_line(
        &mut xml,
        1,
        &format!(
            "<atom:link href=\"{}\" rel=\"self\" type=\"application/rss+xml\"/>",
            escape_xml(&feed_url)
        ),
    );
    push_line(
        &mut xml,
        1,
        &format!("<description>{}</description>", cdata_or_escape(description)),
    );
    push_line(
        &mut xml,
        1,
        &format!(
            "<language>{}</language>",
            escape_xml(non_empty(cfg.language.as_deref()).unwrap_or("en-US"))
        ),
    );
    push_line(&mut xml, 1, &format!("<copyright>{}</copyright>", cdata_or_escape(&copyright)));
    push_line(
        &mut xml,
        1,
        &format!("{LAST_BUILD_DATE_TAG}{}</lastBuildDate>", http_date(now)),
    );
    if let Some(author) = author {
        push_line(&mut xml, 1, &format!("<itunes:author>{}</itunes:author>", cdata_or_escape(author)));
    }
    if let Some(subtitle) = non_empty(cfg.subtitle.as_deref()) {
        push_line(
            &mut xml,
            1,
            &format!("<itunes:subtitle>{}</itunes:subtitle>", cdata_or_escape(subtitle)),
        );
    }
    push_line(&mut xml, 1, &format!("<itunes:summary>{}</itunes:summary>", cdata_or_escape(summary)));
    if let (Some(name), Some(email)) = (
        non_empty(cfg.owner_name.as_deref()),
        non_empty(cfg.owner_email.as_deref()),
    ) {
        push_line(
            &mut xml,
            1,
            &format!(
                "<itunes:owner><itunes:name>{}</itunes:name><itunes:email>{}</itunes:email></itunes:owner>",
                cdata_or_escape(name),
                escape_xml(email)
            ),
        );
    }
    push_line(
        &mut xml,
        1,
        &format!("<itunes:explicit>{}</itunes:explicit>", explicit_label(cfg.is_explicit())),
    );
    if let Some(main) = non_empty(cfg.category_main.as_deref()) {
        let sub = non_empty(cfg.category_sub.as_deref())
            .map(|sub| format!("<itunes:category text=\"{}\"/>", escape_xml(sub)))
            .unwrap_or_default();
        push_line(
            &mut xml,
            1,
            &format!("<itunes:category text=\"{}\">{sub}</itunes:category>", escape_xml(main)),
        );
    }
    if let Some(cover) = input.cover_file.as_deref() {
        let mut segments = vec!["shows", show_id];
        segments.extend(cover.split('/'));
        let cover_url = escape_xml(&asset_url(base, &segments, Some(input.config_modified)));
        push_line(&mut xml, 1, "<image>");
        push_line(&mut xml, 2, &format!("<url>{cover_url}</url>"));
        push_line(&mut xml, 2, &format!("<title>{}</title>", cdata_or_escape(title)));
        push_line(&mut xml, 2, &format!("<link>{}</link>", escape_xml(&channel_link)));
        push_line(&mut xml, 1, "</image>");
        push_line(&mut xml, 1, &format!("<itunes:image href=\"{cover_url}\"/>"));
    }
    push_line(
        &mut xml,
        1,
        &format!(
            "<itunes:type>{}</itunes:type>",
            escape_xml(non_empty(cfg.show_type.as_deref()).unwrap_or("episodic"))
        ),
    );
    if let Some(ttl) = cfg.ttl {
        push_line(&mut xml, 1, &format!("<ttl>{ttl}</ttl>"));
    }
    push_line(&mut xml, 1, &format!("<podcast:guid>{}</podcast:guid>", escape_xml(&guid)));

    for episode in &input.episodes {
        push_item(&mut xml, input, episode, description);
    }

    xml.push_str("</channel>\n</rss>\n");

    let last_modified_secs = input
        .metadata_modified
        .iter()
        .copied()
        .chain(std::iter::once(input.config_modified))
        .max()
        .unwrap_or(0);
    let last_modified = Utc
        .timestamp_opt(last_modified_secs, 0)
        .single()
        .unwrap_or(now);
    let etag = compute_etag(&xml, last_modified_secs, &input.metadata_modified);
    FeedDocument {
        xml,
        etag,
        last_modified,
    }
}

fn push_item(xml: &mut String, input: &FeedInput, episode: &FeedEpisode, show_description: &str) {
    let show_id = input.show_id.as_str();
    let base = &input.base_url;
    let meta = &episode.metadata;
    let ep_id = episode.episode_id.as_str();

    let title = non_empty(meta.title.as_deref()).unwrap_or(ep_id);
    let description = sanitize_html_for_rss(non_empty(meta.description.as_deref()).unwrap_or(show_description));
    let summary = non_empty(meta.summary.as_deref())
        .map(sanitize_html_for_rss)
        .unwrap_or_else(|| description.clone());
    let episode_link = asset_url(base, &["shows", show_id, "episodes", ep_id, "edit"], None);
    let audio_url = asset_url(
        base,
        &["shows", show_id, "episodes", ep_id, &episode.audio_file],
        Some(episode.version),
    );
    let pub_date = meta
        .pubdate
        .as_deref()
        .and_then(parse_pubdate)
        .unwrap_or(episode.directory_modified);

    push_line(xml, 1, "<item>");
    push_line(xml, 2, &format!("<title>{}</title>", cdata_or_escape(title)));
    push_line(xml, 2, &format!("<link>{}</link>", escape_xml(&episode_link)));
    push_line(xml, 2, &format!("<description>{}</description>", cdata_or_escape(&description)));
    push_line(
        xml,
        2,
        &format!(
            "<enclosure url=\"{}\" type=\"{}\" length=\"{}\"/>",
            escape_xml(&audio_url),
            audio_mime_type(&episode.audio_file),
            episode.audio_length
        ),
    );
    push_line(xml, 2, &format!("<guid isPermaLink=\"false\">{}</guid>", escape_xml(&format!("{show_id}_{ep_id}"))));
    push_line(xml, 2, &format!("<pubDate>{}</pubDate>", http_date(pub_date)));
    if let Some(image) = episode.image_file.as_deref() {
        let image_url = asset_url(base, &["shows", show_id, "episodes", ep_id, image], Some(episode.version));
        push_line(xml, 2, &format!("<itunes:image href=\"{}\"/>", escape_xml(&image_url)));
    }
    if !summary.is_empty() {
        push_line(xml, 2, &format!("<itunes:summary>{}</itunes:summary>", cdata_or_escape(&summary)));
    }
    if let Some(transcript) = non_empty(meta.transcript.as_deref()) {
        let lowered = transcript.to_ascii_lowercase();
        let url = if lowered.starts_with("http://") || lowered.starts_with("https://") {
            transcript.to_string()
        } else {
            episode_link.clone()
        };
        push_line(
            xml,
            2,
            &format!(
                "<podcast:transcript url=\"{}\" type=\"{}\"/>",
                escape_xml(&url),
                transcript_mime_type(&url)
            ),
        );
    }
    if let Some(duration) = non_empty(meta.duration.as_deref()) {
        push_line(xml, 2, &format!("<itunes:duration>{}</itunes:duration>", escape_xml(duration)));
    }
    push_line(
        xml,
        2,
        &format!("<itunes:explicit>{}</itunes:explicit>", explicit_label(meta.is_explicit())),
    );
    push_line(xml, 1, "</item>");
}

fn push_line(xml: &mut String, depth: usize, line: &str) {
    for _ in 0..depth {
        xml.push_str("  ");
    }
    xml.push_str(line);
    xml.push('\n');
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Hash of the document without its build timestamp, plus the input mtimes.
pub fn compute_etag(xml: &str, latest_modified: i64, metadata_modified: &[i64]) -> String {
    let mut hasher = Sha256::new();
    for line in xml.lines() {
        if line.trim_start().starts_with(LAST_BUILD_DATE_TAG) {
            continue;
        }
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(latest_modified.to_string().as_bytes());
    for modified in metadata_modified {
        hasher.update(b":");
        hasher.update(modified.to_string().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("\"{}\"", &digest[..16])
}

/// `podcast:guid` derived from the feed URL without scheme or trailing slashes.
pub fn podcast_guid(feed_url: &str) -> Uuid {
    let trimmed = feed_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(feed_url)
        .trim_end_matches('/');
    Uuid::new_v5(&PODCAST_GUID_NAMESPACE, trimmed.as_bytes())
}

pub fn audio_mime_type(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp3" => "audio/mpeg",
        "m4a" | "mp4" => "audio/mp4",
        "aac" => "audio/aac",
        "ogg" | "oga" | "opus" => "audio/ogg",
        "wav" => "audio/x-wav",
        "flac" => "audio/flac",
        _ => "audio/mpeg",
    }
}

fn transcript_mime_type(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".vtt") {
        "text/vtt"
    } else if path.ends_with(".srt") {
        "application/x-subrip"
    } else if path.ends_with(".json") {
        "application/json"
    } else if path.ends_with(".txt") {
        "text/plain"
    } else {
        "text/html"
    }
}

/// Accepts RFC 3339, RFC 2822, `YYYY-MM-DD[ T]HH:MM:SS` and `YYYY-MM-DD` (UTC).
pub fn parse_pubdate(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub fn http_date(dt: DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn asset_url(base: &Url, segments: &[&str], version: Option<i64>) -> String {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    if let Some(version) = version {
        url.query_pairs_mut().append_pair("v", &version.to_string());
    }
    url.to_string()
}

fn unix_seconds(time: SystemTime) -> i64 {
    DateTime::<Utc>::from(time).timestamp()
}

async fn mtime(path: &Path) -> Option<i64> {
    let meta = fs::metadata(path).await.ok()?;
    meta.modified().ok().map(unix_seconds)
}

async fn latest_image_mtime(dir: &Path) -> Option<i64> {
    let mut entries = fs::read_dir(dir).await.ok()?;
    let mut latest = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !has_extension(&path, &IMAGE_EXTENSIONS) {
            continue;
        }
        if let Some(modified) = mtime(&path).await {
            latest = Some(latest.map_or(modified, |current: i64| current.max(modified)));
        }
    }
    latest
}
