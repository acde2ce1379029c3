//! On-disk layout for snapshots and downloaded binaries.
//!
//! ```text
//! {snapshot_root}/{item_id}.html
//! {download_root}/{item_id}/{file name derived from the URL}
//! ```
//!
//! Paths depend only on item identity and resource URL, so re-running a stage
//! overwrites the same file instead of accumulating copies.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use url::Url;

use super::client::bytes_md5;

/// Longest file name kept from a URL before falling back to a hash.
const MAX_FILENAME_CHARS: usize = 120;

/// Characters kept from a hash-based fallback name.
const FALLBACK_HASH_CHARS: usize = 16;

/// Replaces anything outside `[A-Za-z0-9._-]` with `_`, collapsing runs.
pub(crate) fn sanitize_filename_component(value: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '.') {
            out.push(ch);
            prev_sep = false;
        } else if !prev_sep {
            out.push('_');
            prev_sep = true;
        }
    }
    out.trim_matches(|c| c == '_' || c == '.').to_string()
}

/// File name for a binary resource: the decoded last path segment, or a
/// hash of the URL when that is unusable. Always ends in an extension.
#[must_use]
pub fn resource_file_name(url: &str) -> String {
    let from_path = Url::parse(url).ok().and_then(|parsed| {
        let last = parsed.path_segments()?.next_back()?.to_string();
        let decoded = urlencoding::decode(&last).map(|c| c.into_owned()).ok()?;
        let name = sanitize_filename_component(&decoded);
        (!name.is_empty() && name.chars().count() <= MAX_FILENAME_CHARS).then_some(name)
    });

    let name = from_path.unwrap_or_else(|| {
        let hash = bytes_md5(url.as_bytes());
        format!("{}.pdf", &hash[..FALLBACK_HASH_CHARS])
    });

    if Path::new(&name).extension().is_some() {
        name
    } else {
        format!("{name}.pdf")
    }
}

/// Where the binary at `url` for item `item_id` is stored.
#[must_use]
pub fn resource_path(download_root: &Path, item_id: i64, url: &str) -> PathBuf {
    download_root
        .join(item_id.to_string())
        .join(resource_file_name(url))
}

/// Where the HTML snapshot of item `item_id` is stored.
#[must_use]
pub fn snapshot_path(snapshot_root: &Path, item_id: i64) -> PathBuf {
    snapshot_root.join(format!("{item_id}.html"))
}

/// File name prefix for in-flight temp files of `final_path`.
///
/// Each attempt appends a random suffix, so concurrent transfers of the
/// same target never write to the same file.
#[must_use]
pub(crate) fn partial_prefix(final_path: &Path) -> OsString {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename_component() {
        assert_eq!(sanitize_filename_component("Relatório final.pdf"), "Relat_rio_final.pdf");
        assert_eq!(sanitize_filename_component("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_filename_component("a::b"), "a_b");
    }

    #[test]
    fn test_resource_file_name_from_path() {
        assert_eq!(
            resource_file_name("https://repo.example/bitstream/123/1/file.pdf"),
            "file.pdf"
        );
        assert_eq!(
            resource_file_name("https://repo.example/bitstream/1/Boletim%20T%C3%A9cnico.pdf?sequence=1"),
            "Boletim_T_cnico.pdf"
        );
    }

    #[test]
    fn test_resource_file_name_adds_extension() {
        assert_eq!(
            resource_file_name("https://repo.example/bitstream/123/download"),
            "download.pdf"
        );
    }

    #[test]
    fn test_resource_file_name_falls_back_to_hash() {
        let url = "https://repo.example/";
        let name = resource_file_name(url);
        assert_eq!(name.len(), FALLBACK_HASH_CHARS + ".pdf".len());
        assert!(name.starts_with(&bytes_md5(url.as_bytes())[..FALLBACK_HASH_CHARS]));
    }

    #[test]
    fn test_layout_is_deterministic() {
        let root = Path::new("/data/pdfs");
        let url = "https://repo.example/bitstream/9/a.pdf";
        assert_eq!(resource_path(root, 9, url), resource_path(root, 9, url));
        assert_eq!(
            resource_path(root, 9, url),
            PathBuf::from("/data/pdfs/9/a.pdf")
        );
        assert_eq!(
            snapshot_path(Path::new("/data/html"), 9),
            PathBuf::from("/data/html/9.html")
        );
        assert_eq!(partial_prefix(Path::new("/data/pdfs/9/a.pdf")), "a.pdf.");
    }
}
