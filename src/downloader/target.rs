//! URL validation and destination resolution.

use std::path::{Component, Path, PathBuf};
use url::Url;

use crate::error::{Error, Result};

/// Resolved destination of a download
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// Plain filesystem path
    File(PathBuf),
    /// Entry inside a ZIP container
    Archive {
        /// Path of the `.zip` file
        container: PathBuf,
        /// `/`-separated entry name inside the container
        entry: String,
    },
}

impl Target {
    /// Path shown to the presentation surface (`container.zip/entry` for archives)
    pub fn display_path(&self) -> PathBuf {
        match self {
            Target::File(path) => path.clone(),
            Target::Archive { container, entry } => container.join(entry),
        }
    }

    /// Container path for archive targets
    pub fn container(&self) -> Option<&Path> {
        match self {
            Target::File(_) => None,
            Target::Archive { container, .. } => Some(container),
        }
    }
}

/// Parse and check a source URL; only absolute http(s) URLs are accepted
pub fn validate_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::Validation(format!("invalid URL '{}': {}", raw, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::Validation(format!(
                "unsupported URL scheme '{}' in '{}'",
                other, raw
            )));
        }
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::Validation(format!("URL '{}' has no host", raw)));
    }

    Ok(url)
}

/// File name taken from the last path segment of `url`
pub fn filename_from_url(url: &Url) -> Result<String> {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    let decoded = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());

    let name = sanitize_filename(&decoded);
    if name.is_empty() {
        return Err(Error::Validation(format!(
            "cannot derive a file name from '{}'",
            url
        )));
    }
    Ok(name)
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned.trim().trim_matches('.').trim().to_string()
}

fn is_zip(component: &Component<'_>) -> bool {
    match component {
        Component::Normal(name) => name.to_string_lossy().to_ascii_lowercase().ends_with(".zip"),
        _ => false,
    }
}

fn has_trailing_separator(raw: &Path) -> bool {
    let text = raw.as_os_str().to_string_lossy();
    text.ends_with('/') || text.ends_with(std::path::MAIN_SEPARATOR)
}

/// Compute where `url` is written
///
/// - no destination: `download_dir/<name from URL>`
/// - relative destinations are joined onto `download_dir`
/// - a directory (trailing separator or existing directory) gets the name
///   from the URL appended
/// - a path that continues past a `*.zip` component targets an entry in that
///   container; `album.zip/` alone stores the URL's file name as the entry
///
/// Runs on the caller's thread. A destination without a trailing separator
/// costs one blocking `metadata` call to detect an existing directory; pass a
/// trailing separator to skip it.
pub fn resolve_target(url: &Url, destination: Option<&Path>, download_dir: &Path) -> Result<Target> {
    let (path, trailing) = match destination {
        Some(raw) if !raw.as_os_str().is_empty() => {
            let trailing = has_trailing_separator(raw);
            if raw.is_absolute() {
                (raw.to_path_buf(), trailing)
            } else {
                (download_dir.join(raw), trailing)
            }
        }
        _ => (download_dir.to_path_buf(), true),
    };
    let is_dir = trailing || path.is_dir();

    let components: Vec<Component<'_>> = path.components().collect();
    if let Some(split) = components.iter().position(is_zip) {
        let container: PathBuf = components[..=split].iter().collect();
        let mut parts = Vec::new();
        for component in &components[split + 1..] {
            match component {
                Component::Normal(name) => parts.push(name.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => {
                    return Err(Error::Validation(format!(
                        "invalid archive entry path '{}'",
                        path.display()
                    )));
                }
            }
        }

        // a bare `*.zip` that is not an existing directory is a plain file
        if parts.is_empty() && !is_dir {
            return Ok(Target::File(path.clone()));
        }
        if parts.is_empty() || is_dir {
            parts.push(filename_from_url(url)?);
        }
        return Ok(Target::Archive {
            container,
            entry: parts.join("/"),
        });
    }

    if is_dir {
        Ok(Target::File(path.join(filename_from_url(url)?)))
    } else {
        Ok(Target::File(path))
    }
}
