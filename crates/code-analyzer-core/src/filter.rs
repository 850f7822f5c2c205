//! Snapshot file filtering.
//!
//! Decides which files of a repository are worth embedding. Hidden paths,
//! configuration files and images are dropped; everything else is kept.

const CONFIG_EXTENSIONS: &[&str] = &["json", "yaml", "yml", "toml"];

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp", "svg"];

/// True if any `/`-separated component of `path` starts with a dot.
pub fn is_hidden(path: &str) -> bool {
    path.split('/').any(|part| part.starts_with('.'))
}

pub fn is_config(path: &str) -> bool {
    extension(path).is_some_and(|ext| CONFIG_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_image(path: &str) -> bool {
    extension(path).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Whether a file at relative `path` should be snapshotted.
pub fn should_ingest(path: &str) -> bool {
    !(is_hidden(path) || is_config(path) || is_image(path))
}

fn extension(path: &str) -> Option<String> {
    let file_name = path.rsplit('/').next()?;
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
