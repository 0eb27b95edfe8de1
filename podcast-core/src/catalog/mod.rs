//! File-backed show and episode records.

mod error;
mod models;
mod store;
mod text;

pub use error::{CatalogError, CatalogResult};
pub use models::{audio_reference, ConversionStatus, EpisodeMetadata, NewEpisode, ShowFeedConfig};
pub use store::{
    first_file_with_extension, has_extension, validate_id, Catalog, AUDIO_EXTENSIONS,
    EPISODE_METADATA_FILE, IMAGE_EXTENSIONS, SHOW_CONFIG_FILE,
};
pub use text::{
    cdata_or_escape, escape_xml, explicit_label, normalize_explicit, plain_text_to_html,
    sanitize_html_for_rss,
};
