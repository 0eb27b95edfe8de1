use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use super::error::{CatalogError, CatalogResult};
use super::models::{non_empty, ConversionStatus, EpisodeMetadata, NewEpisode, ShowFeedConfig};
use super::text::{explicit_label, normalize_explicit, plain_text_to_html, sanitize_html_for_rss};

pub const SHOW_CONFIG_FILE: &str = "config.json";
pub const EPISODE_METADATA_FILE: &str = "metadata.json";

pub const IMAGE_EXTENSIONS: [&str; 8] = ["png", "jpg", "jpeg", "webp", "gif", "bmp", "svg", "ico"];
pub const AUDIO_EXTENSIONS: [&str; 6] = ["mp3", "wav", "ogg", "m4a", "flac", "aac"];

type EpisodeLocks = StdMutex<HashMap<(String, String), Arc<Mutex<()>>>>;

/// Show and episode records kept as JSON files under the shows directory.
///
/// Two per-episode locks guard an episode:
/// - [`Catalog::lock_episode`] covers one read, modify and save of the record
///   and is never held across external tools.
/// - [`Catalog::claim_audio`] covers the audio files for the length of a
///   processing job. Request handlers only use [`Catalog::try_claim_audio`].
#[derive(Debug)]
pub struct Catalog {
    shows_dir: PathBuf,
    locks: EpisodeLocks,
    claims: EpisodeLocks,
}

impl Catalog {
    pub fn new<P: Into<PathBuf>>(shows_dir: P) -> Self {
        Self {
            shows_dir: shows_dir.into(),
            locks: StdMutex::new(HashMap::new()),
            claims: StdMutex::new(HashMap::new()),
        }
    }

    pub fn shows_dir(&self) -> &Path {
        &self.shows_dir
    }

    pub fn show_dir(&self, show_id: &str) -> CatalogResult<PathBuf> {
        validate_id(show_id)?;
        Ok(self.shows_dir.join(show_id))
    }

    pub fn episode_dir(&self, show_id: &str, episode_id: &str) -> CatalogResult<PathBuf> {
        validate_id(episode_id)?;
        Ok(self.show_dir(show_id)?.join("episodes").join(episode_id))
    }

    pub fn show_config_path(&self, show_id: &str) -> CatalogResult<PathBuf> {
        Ok(self.show_dir(show_id)?.join(SHOW_CONFIG_FILE))
    }

    pub fn metadata_path(&self, show_id: &str, episode_id: &str) -> CatalogResult<PathBuf> {
        Ok(self.episode_dir(show_id, episode_id)?.join(EPISODE_METADATA_FILE))
    }

    /// A show directory without `config.json` gets the default config.
    pub async fn load_show(&self, show_id: &str) -> CatalogResult<ShowFeedConfig> {
        let path = self.show_config_path(show_id)?;
        if let Some(config) = read_json(&path).await? {
            return Ok(config);
        }
        match fs::metadata(self.show_dir(show_id)?).await {
            Ok(meta) if meta.is_dir() => Ok(ShowFeedConfig::default()),
            _ => Err(CatalogError::ShowNotFound(show_id.to_string())),
        }
    }

    pub async fn save_show(&self, show_id: &str, config: &ShowFeedConfig) -> CatalogResult<()> {
        let dir = self.show_dir(show_id)?;
        let episodes = dir.join("episodes");
        fs::create_dir_all(&episodes).await.map_err(io_error(&episodes))?;
        write_json_atomic(dir.join(SHOW_CONFIG_FILE), config).await
    }

    /// Episode directory names, newest first by name.
    pub async fn list_episode_ids(&self, show_id: &str) -> CatalogResult<Vec<String>> {
        let dir = self.show_dir(show_id)?.join("episodes");
        let mut ids = list_dirs(&dir).await?;
        ids.sort_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    pub async fn load_episode(&self, show_id: &str, episode_id: &str) -> CatalogResult<EpisodeMetadata> {
        let path = self.metadata_path(show_id, episode_id)?;
        read_json(&path)
            .await?
            .ok_or_else(|| CatalogError::EpisodeNotFound {
                show_id: show_id.to_string(),
                episode_id: episode_id.to_string(),
            })
    }

    pub async fn save_episode(
        &self,
        show_id: &str,
        episode_id: &str,
        metadata: &EpisodeMetadata,
    ) -> CatalogResult<()> {
        let dir = self.episode_dir(show_id, episode_id)?;
        fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;
        write_json_atomic(dir.join(EPISODE_METADATA_FILE), metadata).await
    }

    pub async fn lock_episode(&self, show_id: &str, episode_id: &str) -> OwnedMutexGuard<()> {
        keyed_lock(&self.locks, show_id, episode_id).lock_owned().await
    }

    /// Waits for exclusive use of the episode's audio files.
    pub async fn claim_audio(&self, show_id: &str, episode_id: &str) -> OwnedMutexGuard<()> {
        keyed_lock(&self.claims, show_id, episode_id).lock_owned().await
    }

    /// Takes the audio claim or fails with `EpisodeBusy` when a job holds it.
    pub fn try_claim_audio(&self, show_id: &str, episode_id: &str) -> CatalogResult<OwnedMutexGuard<()>> {
        keyed_lock(&self.claims, show_id, episode_id)
            .try_lock_owned()
            .map_err(|_| CatalogError::EpisodeBusy {
                show_id: show_id.to_string(),
                episode_id: episode_id.to_string(),
            })
    }

    /// Creates a `pending` episode with a fresh id.
    pub async fn create_episode(
        &self,
        show_id: &str,
        draft: &NewEpisode,
    ) -> CatalogResult<(String, EpisodeMetadata)> {
        if !fs::metadata(self.show_dir(show_id)?).await.is_ok_and(|meta| meta.is_dir()) {
            return Err(CatalogError::ShowNotFound(show_id.to_string()));
        }
        let episode_id = loop {
            let candidate = Uuid::new_v4().simple().to_string()[..8].to_string();
            if fs::metadata(self.episode_dir(show_id, &candidate)?).await.is_err() {
                break candidate;
            }
        };

        let metadata = EpisodeMetadata {
            id: Some(episode_id.clone()),
            title: Some(draft.title.trim().to_string()),
            description: Some(sanitize_html_for_rss(&plain_text_to_html(&draft.description))),
            summary: Some(sanitize_html_for_rss(&plain_text_to_html(&draft.summary))),
            explicit: Some(
                explicit_label(draft.explicit.as_deref().map(normalize_explicit).unwrap_or(false))
                    .to_string(),
            ),
            language: Some(
                non_empty(draft.language.as_deref())
                    .unwrap_or("en-US")
                    .to_string(),
            ),
            category_main: draft.category_main.clone(),
            category_sub: draft.category_sub.clone(),
            duration: draft.duration.clone(),
            pubdate: draft.pubdate.clone(),
            transcript: draft.transcript.clone(),
            conversion_status: Some(ConversionStatus::Pending),
            ..EpisodeMetadata::default()
        };
        let _guard = self.lock_episode(show_id, &episode_id).await;
        self.save_episode(show_id, &episode_id, &metadata).await?;
        info!(show = show_id, episode = %episode_id, "created episode");
        Ok((episode_id, metadata))
    }

    /// Moves an audio file into the episode directory and marks it `processing`.
    ///
    /// The previous `filename` and its probed attributes no longer describe
    /// the audio, so `filename` is cleared until processing succeeds. Callers
    /// hold the episode's audio claim. Returns the new location of the audio.
    pub async fn attach_audio(
        &self,
        show_id: &str,
        episode_id: &str,
        source: &Path,
        file_name: &str,
    ) -> CatalogResult<PathBuf> {
        let _guard = self.lock_episode(show_id, episode_id).await;
        let mut metadata = self.load_episode(show_id, episode_id).await?;
        let dir = self.episode_dir(show_id, episode_id)?;
        let target = dir.join(file_name);
        move_file(source, &target).await?;

        metadata.set_audio_reference(show_id, episode_id, file_name);
        metadata.filename = None;
        metadata.mark_processing();
        self.save_episode(show_id, episode_id, &metadata).await?;
        debug!(
            show = show_id,
            episode = episode_id,
            file = %target.display(),
            "attached audio"
        );
        Ok(target)
    }

    /// Current audio file of an episode.
    ///
    /// Uses the recorded reference and otherwise the first audio file in the
    /// episode directory.
    pub async fn locate_audio(
        &self,
        show_id: &str,
        episode_id: &str,
        metadata: &EpisodeMetadata,
    ) -> CatalogResult<Option<PathBuf>> {
        let dir = self.episode_dir(show_id, episode_id)?;
        if let Some(name) = metadata.audio_file_name() {
            let path = dir.join(name);
            if fs::metadata(&path).await.is_ok() {
                return Ok(Some(path));
            }
        }
        Ok(first_file_with_extension(&dir, &AUDIO_EXTENSIONS).await)
    }

    /// Cover image of an episode, preferring the one named in its record.
    pub async fn find_episode_cover(
        &self,
        show_id: &str,
        episode_id: &str,
        metadata: &EpisodeMetadata,
    ) -> CatalogResult<Option<PathBuf>> {
        let dir = self.episode_dir(show_id, episode_id)?;
        if let Some(name) = non_empty(metadata.episode_image.as_deref())
            .and_then(|image| Path::new(image).file_name())
        {
            let path = dir.join(name);
            if fs::metadata(&path).await.is_ok() {
                return Ok(Some(path));
            }
        }
        Ok(first_file_with_extension(&dir, &IMAGE_EXTENSIONS).await)
    }

    /// Show cover: the configured image when present on disk, else the first image file.
    pub async fn find_show_cover(
        &self,
        show_id: &str,
        config: &ShowFeedConfig,
    ) -> CatalogResult<Option<PathBuf>> {
        let dir = self.show_dir(show_id)?;
        if let Some(image) = non_empty(config.image.as_deref()) {
            let path = dir.join(image);
            if path.starts_with(&dir) && fs::metadata(&path).await.is_ok() {
                return Ok(Some(path));
            }
        }
        Ok(first_file_with_extension(&dir, &IMAGE_EXTENSIONS).await)
    }
}

/// Identifiers become path segments; reject anything that could escape.
pub fn validate_id(id: &str) -> CatalogResult<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CatalogError::InvalidId(id.to_string()))
    }
}

pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

pub async fn first_file_with_extension(dir: &Path, extensions: &[&str]) -> Option<PathBuf> {
    let mut entries = fs::read_dir(dir).await.ok()?;
    let mut matches = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if is_file && !hidden && has_extension(&path, extensions) {
            matches.push(path);
        }
    }
    matches.sort();
    matches.into_iter().next()
}

fn keyed_lock(locks: &EpisodeLocks, show_id: &str, episode_id: &str) -> Arc<Mutex<()>> {
    let mut locks = locks.lock().unwrap_or_else(|poison| poison.into_inner());
    locks
        .entry((show_id.to_string(), episode_id.to_string()))
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

async fn list_dirs(dir: &Path) -> CatalogResult<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error(dir)(err)),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_error(dir))? {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
    }
    Ok(names)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> CatalogResult<Option<T>> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(path)(err)),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| CatalogError::Malformed {
            source,
            path: path.to_path_buf(),
        })
}

async fn write_json_atomic<T: Serialize>(path: PathBuf, value: &T) -> CatalogResult<()> {
    let payload = serde_json::to_vec_pretty(value)?;
    tokio::task::spawn_blocking(move || persist_atomic(&path, &payload)).await?
}

fn persist_atomic(path: &Path, payload: &[u8]) -> CatalogResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_error(dir))?;
    tmp.write_all(payload).map_err(io_error(tmp.path()))?;
    tmp.as_file().sync_all().map_err(io_error(path))?;
    tmp.persist(path).map_err(|err| CatalogError::Io {
        source: err.error,
        path: path.to_path_buf(),
    })?;
    Ok(())
}

async fn move_file(source: &Path, target: &Path) -> CatalogResult<()> {
    if fs::rename(source, target).await.is_ok() {
        return Ok(());
    }
    // Assembled uploads may sit on another filesystem.
    fs::copy(source, target).await.map_err(io_error(target))?;
    fs::remove_file(source).await.map_err(io_error(source))?;
    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CatalogError + '_ {
    move |source| CatalogError::Io {
        source,
        path: path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn catalog_with_show(root: &Path) -> Catalog {
        let catalog = Catalog::new(root.join("shows"));
        let config = ShowFeedConfig {
            title: Some("Morning Show".into()),
            ..ShowFeedConfig::default()
        };
        catalog.save_show("morning", &config).await.unwrap();
        catalog
    }

    #[tokio::test]
    async fn create_and_attach_episode() {
        let dir = tempdir().unwrap();
        let catalog = catalog_with_show(dir.path()).await;
        let draft = NewEpisode {
            title: "  Pilot ".into(),
            description: "Hello & welcome\n\n- one".into(),
            explicit: Some("да".into()),
            ..NewEpisode::default()
        };
        let (episode_id, created) = catalog.create_episode("morning", &draft).await.unwrap();
        assert_eq!(episode_id.len(), 8);
        assert_eq!(created.status(), ConversionStatus::Pending);
        assert_eq!(created.title.as_deref(), Some("Pilot"));
        assert_eq!(created.explicit.as_deref(), Some("true"));
        assert_eq!(
            created.description.as_deref(),
            Some("<p>Hello &amp; welcome</p>\n<ul>\n<li>one</li>\n</ul>")
        );

        let upload = dir.path().join("assembled.wav");
        std::fs::write(&upload, b"RIFF").unwrap();
        let target = catalog
            .attach_audio("morning", &episode_id, &upload, "pilot.wav")
            .await
            .unwrap();
        assert!(target.exists());
        assert!(!upload.exists());

        let stored = catalog.load_episode("morning", &episode_id).await.unwrap();
        assert_eq!(stored.status(), ConversionStatus::Processing);
        assert_eq!(
            stored.audio.as_deref(),
            Some(format!("/shows/morning/episodes/{episode_id}/pilot.wav").as_str())
        );
        let located = catalog.locate_audio("morning", &episode_id, &stored).await.unwrap();
        assert_eq!(located, Some(target));
    }

    #[tokio::test]
    async fn episodes_listed_newest_first() {
        let dir = tempdir().unwrap();
        let catalog = catalog_with_show(dir.path()).await;
        for id in ["2024-01-01", "2024-03-01", "2024-02-01"] {
            catalog
                .save_episode("morning", id, &EpisodeMetadata::default())
                .await
                .unwrap();
        }
        let ids = catalog.list_episode_ids("morning").await.unwrap();
        assert_eq!(ids, vec!["2024-03-01", "2024-02-01", "2024-01-01"]);
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let dir = tempdir().unwrap();
        let catalog = catalog_with_show(dir.path()).await;
        assert!(matches!(
            catalog.load_show("evening").await,
            Err(CatalogError::ShowNotFound(_))
        ));
        assert!(matches!(
            catalog.load_episode("morning", "nope").await,
            Err(CatalogError::EpisodeNotFound { .. })
        ));
        assert!(matches!(
            catalog.create_episode("evening", &NewEpisode::default()).await,
            Err(CatalogError::ShowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn bare_show_directory_uses_default_config() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(dir.path());
        std::fs::create_dir_all(dir.path().join("quiet")).unwrap();
        assert_eq!(catalog.load_show("quiet").await.unwrap(), ShowFeedConfig::default());
    }

    #[tokio::test]
    async fn traversal_ids_are_rejected() {
        let dir = tempdir().unwrap();
        let catalog = catalog_with_show(dir.path()).await;
        assert!(matches!(
            catalog.load_episode("morning", "..").await,
            Err(CatalogError::InvalidId(_))
        ));
        assert!(matches!(
            catalog.load_show("../etc").await,
            Err(CatalogError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn malformed_metadata_is_reported() {
        let dir = tempdir().unwrap();
        let catalog = catalog_with_show(dir.path()).await;
        let ep_dir = catalog.episode_dir("morning", "broken").unwrap();
        std::fs::create_dir_all(&ep_dir).unwrap();
        std::fs::write(ep_dir.join(EPISODE_METADATA_FILE), b"{not json").unwrap();
        assert!(matches!(
            catalog.load_episode("morning", "broken").await,
            Err(CatalogError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn show_cover_falls_back_to_first_image() {
        let dir = tempdir().unwrap();
        let catalog = catalog_with_show(dir.path()).await;
        let show_dir = catalog.show_dir("morning").unwrap();
        std::fs::write(show_dir.join("b.png"), b"png").unwrap();
        std::fs::write(show_dir.join("a.jpg"), b"jpg").unwrap();

        let config = ShowFeedConfig {
            image: Some("missing.png".into()),
            ..ShowFeedConfig::default()
        };
        let cover = catalog.find_show_cover("morning", &config).await.unwrap();
        assert_eq!(cover, Some(show_dir.join("a.jpg")));

        let config = ShowFeedConfig {
            image: Some("b.png".into()),
            ..ShowFeedConfig::default()
        };
        let cover = catalog.find_show_cover("morning", &config).await.unwrap();
        assert_eq!(cover, Some(show_dir.join("b.png")));
    }

    #[tokio::test]
    async fn episode_lock_serializes_writers() {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(catalog_with_show(dir.path()).await);
        let guard = catalog.lock_episode("morning", "ep").await;
        let contender = {
            let catalog = Arc::clone(&catalog);
            tokio::spawn(async move {
                let _guard = catalog.lock_episode("morning", "ep").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }
}
