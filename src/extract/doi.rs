//! DOI recognition in repository identifiers and page text.
//!
//! Repositories advertise DOIs in three shapes: `doi:10.x/y`, a resolver URL
//! (`https://doi.org/10.x/y`), or a bare `10.x/y`. All are normalized to the
//! bare lowercase-prefix form.

use std::sync::LazyLock;

use regex::Regex;

/// Bare DOI anchored to the whole value: `10.XXXX/suffix`.
#[allow(clippy::expect_used)]
static BARE_DOI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^10\.\d{4,9}(?:\.\d+)*/[^\s<>"']+$"#).expect("bare DOI regex is valid")
});

/// DOI anywhere in free text, with an optional `doi:` or resolver prefix.
#[allow(clippy::expect_used)]
static EMBEDDED_DOI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:doi:\s*|https?://(?:dx\.)?doi\.org/|\b)(10\.\d{4,9}(?:\.\d+)*/[^\s<>"']+)"#)
        .expect("embedded DOI regex is valid")
});

const RESOLVER_HOSTS: [&str; 2] = ["doi.org/", "dx.doi.org/"];

/// Trailing punctuation that belongs to the surrounding sentence.
fn trim_trailing(doi: &str) -> &str {
    doi.trim_end_matches(['.', ',', ';', ')', ']'])
}

/// Recognizes a single identifier value as a DOI.
///
/// ```
/// use harvester_core::extract::detect_doi;
///
/// assert_eq!(detect_doi("doi:10.1590/S0100-204X").as_deref(), Some("10.1590/S0100-204X"));
/// assert_eq!(detect_doi("https://doi.org/10.1234/abc").as_deref(), Some("10.1234/abc"));
/// assert_eq!(detect_doi("10.1234/abc").as_deref(), Some("10.1234/abc"));
/// assert_eq!(detect_doi("https://repo.example/handle/10.1234/5"), None);
/// ```
#[must_use]
pub fn detect_doi(value: &str) -> Option<String> {
    let value = value.trim();
    let lower = value.to_ascii_lowercase();

    let candidate = if lower.starts_with("doi:") {
        value[4..].trim_start()
    } else if let Some(rest) = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
    {
        let host = RESOLVER_HOSTS.iter().find(|h| rest.starts_with(*h))?;
        let offset = value.len() - rest.len() + host.len();
        &value[offset..]
    } else {
        value
    };

    let decoded = urlencoding::decode(candidate)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| candidate.to_string());
    let doi = trim_trailing(decoded.trim());
    BARE_DOI.is_match(doi).then(|| doi.to_string())
}

/// Finds the first DOI mentioned anywhere in `text`.
#[must_use]
pub fn find_doi(text: &str) -> Option<String> {
    EMBEDDED_DOI
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| trim_trailing(m.as_str()).to_string())
        .find(|doi| BARE_DOI.is_match(doi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_doi_shapes() {
        assert_eq!(detect_doi("DOI: 10.1000.10/xyz").as_deref(), Some("10.1000.10/xyz"));
        assert_eq!(
            detect_doi("http://dx.doi.org/10.1590/0100-204x%2F2020").as_deref(),
            Some("10.1590/0100-204x/2020")
        );
        assert_eq!(detect_doi(" 10.4336/2010.pfb.30.62.01. ").as_deref(), Some("10.4336/2010.pfb.30.62.01"));
    }

    #[test]
    fn test_detect_doi_rejects_non_doi() {
        assert_eq!(detect_doi("http://www.alice.cnptia.embrapa.br/alice/handle/doc/1"), None);
        assert_eq!(detect_doi("10.12/short-registrant"), None);
        assert_eq!(detect_doi("doi:"), None);
        assert_eq!(detect_doi(""), None);
    }

    #[test]
    fn test_find_doi_in_text() {
        assert_eq!(
            find_doi("Published as doi:10.1590/S1413-70542019 (2019).").as_deref(),
            Some("10.1590/S1413-70542019")
        );
        assert_eq!(
            find_doi(r#"<a href="https://doi.org/10.5555/abc">link</a>"#).as_deref(),
            Some("10.5555/abc")
        );
        assert_eq!(find_doi("no identifiers here"), None);
    }
}
