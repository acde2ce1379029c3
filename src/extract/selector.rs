//! Selector rules and ordered fallback chains over HTML pages.
//!
//! A rule is written as a prefixed string:
//!
//! | Rule | Yields |
//! |------|--------|
//! | `css:h2.title` | trimmed text of matching elements |
//! | `attr:a.pdf@href` | the attribute of matching elements |
//! | `meta:DC.creator` | `content` of `<meta name=..>` / `<meta property=..>` |
//! | `regex:doi:(10\.\d+/\S+)` | first capture group (or whole match) over the raw HTML |
//!
//! A [`SelectorChain`] tries its rules in order; the first rule that yields
//! anything non-empty wins and the rest are never evaluated.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::error;

use super::error::ExtractError;

/// A parsed HTML document plus its raw source.
///
/// Not `Send`: parse, evaluate and drop it without crossing an `.await`.
pub struct ParsedPage<'a> {
    raw: &'a str,
    document: Html,
}

impl<'a> ParsedPage<'a> {
    #[must_use]
    pub fn parse(raw: &'a str) -> Self {
        Self {
            raw,
            document: Html::parse_document(raw),
        }
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        self.raw
    }

    #[must_use]
    pub fn document(&self) -> &Html {
        &self.document
    }
}

#[derive(Debug, Clone)]
enum RuleKind {
    Css(Selector),
    Attr { selector: Selector, attribute: String },
    Meta(String),
    Regex(Regex),
}

/// One selector expression.
#[derive(Debug, Clone)]
pub struct SelectorRule {
    source: String,
    kind: RuleKind,
}

fn parse_css(rule: &str, css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::invalid_selector(rule, e.to_string()))
}

impl FromStr for SelectorRule {
    type Err = ExtractError;

    fn from_str(rule: &str) -> Result<Self, Self::Err> {
        let rule = rule.trim();
        let (prefix, body) = rule
            .split_once(':')
            .ok_or_else(|| ExtractError::invalid_selector(rule, "missing rule prefix"))?;
        let body = body.trim();
        if body.is_empty() {
            return Err(ExtractError::invalid_selector(rule, "empty rule body"));
        }

        let kind = match prefix {
            "css" => RuleKind::Css(parse_css(rule, body)?),
            "attr" => {
                let (css, attribute) = body.rsplit_once('@').ok_or_else(|| {
                    ExtractError::invalid_selector(rule, "expected <selector>@<attribute>")
                })?;
                if attribute.trim().is_empty() {
                    return Err(ExtractError::invalid_selector(rule, "empty attribute name"));
                }
                RuleKind::Attr {
                    selector: parse_css(rule, css)?,
                    attribute: attribute.trim().to_string(),
                }
            }
            "meta" => RuleKind::Meta(body.to_ascii_lowercase()),
            "regex" => RuleKind::Regex(
                Regex::new(body).map_err(|e| ExtractError::invalid_selector(rule, e.to_string()))?,
            ),
            other => {
                return Err(ExtractError::invalid_selector(
                    rule,
                    format!("unknown rule prefix '{other}'"),
                ));
            }
        };

        Ok(Self {
            source: rule.to_string(),
            kind,
        })
    }
}

impl fmt::Display for SelectorRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl SelectorRule {
    /// Every non-empty value this rule yields on `page`, in document order.
    #[must_use]
    pub fn evaluate(&self, page: &ParsedPage<'_>) -> Vec<String> {
        let values: Vec<String> = match &self.kind {
            RuleKind::Css(selector) => page
                .document()
                .select(selector)
                .map(|el| collapse_whitespace(&el.text().collect::<String>()))
                .collect(),
            RuleKind::Attr {
                selector,
                attribute,
            } => page
                .document()
                .select(selector)
                .filter_map(|el| el.value().attr(attribute))
                .map(|v| v.trim().to_string())
                .collect(),
            RuleKind::Meta(name) => meta_values(page.document(), name),
            RuleKind::Regex(regex) => regex
                .captures_iter(page.raw())
                .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
                .map(|m| m.as_str().trim().to_string())
                .collect(),
        };
        values.into_iter().filter(|v| !v.is_empty()).collect()
    }
}

fn meta_values(document: &Html, name: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse("meta[content]") else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter(|el| {
            let attrs = el.value();
            attrs
                .attr("name")
                .or_else(|| attrs.attr("property"))
                .is_some_and(|n| n.trim().eq_ignore_ascii_case(name))
        })
        .filter_map(|el| el.value().attr("content"))
        .map(collapse_whitespace)
        .collect()
}

/// Ordered fallback chain of rules for one field.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct SelectorChain {
    rules: Vec<SelectorRule>,
}

impl TryFrom<Vec<String>> for SelectorChain {
    type Error = ExtractError;

    fn try_from(rules: Vec<String>) -> Result<Self, Self::Error> {
        Self::parse(rules.iter().map(String::as_str))
    }
}

impl SelectorChain {
    /// Parses each rule in order.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::InvalidSelector`] for the first bad rule, or
    /// when the chain is empty.
    pub fn parse<'r>(rules: impl IntoIterator<Item = &'r str>) -> Result<Self, ExtractError> {
        let rules = rules
            .into_iter()
            .map(SelectorRule::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        if rules.is_empty() {
            return Err(ExtractError::invalid_selector("", "selector chain is empty"));
        }
        Ok(Self { rules })
    }

    /// Chains for built-in defaults, which are known to parse.
    ///
    /// A rule that fails to parse is logged and left out of release builds.
    pub(crate) fn builtin(rules: &[&str]) -> Self {
        let parsed: Vec<SelectorRule> = rules
            .iter()
            .filter_map(|raw| match raw.parse() {
                Ok(rule) => Some(rule),
                Err(e) => {
                    error!(rule = raw, error = %e, "built-in selector rule does not parse");
                    None
                }
            })
            .collect();
        debug_assert_eq!(parsed.len(), rules.len(), "built-in selector rule does not parse");
        Self { rules: parsed }
    }

    #[must_use]
    pub fn rules(&self) -> &[SelectorRule] {
        &self.rules
    }

    /// Values of the first rule that yields anything, with that rule.
    #[must_use]
    pub fn evaluate(&self, page: &ParsedPage<'_>) -> Option<(&SelectorRule, Vec<String>)> {
        self.rules.iter().find_map(|rule| {
            let values = rule.evaluate(page);
            (!values.is_empty()).then_some((rule, values))
        })
    }

    /// First value of the winning rule.
    #[must_use]
    pub fn first(&self, page: &ParsedPage<'_>) -> Option<String> {
        self.evaluate(page)
            .and_then(|(_, values)| values.into_iter().next())
    }

    /// All values of the winning rule, duplicates removed.
    #[must_use]
    pub fn all(&self, page: &ParsedPage<'_>) -> Vec<String> {
        let mut values = self.evaluate(page).map(|(_, v)| v).unwrap_or_default();
        let mut seen = std::collections::HashSet::new();
        values.retain(|v| seen.insert(v.clone()));
        values
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head>
        <meta name="DC.title" content="Manejo do solo">
        <meta name="citation_author" content="Silva, A.">
        <meta name="citation_author" content="Souza, B.">
        <meta property="og:title" content="OG title">
        </head><body>
        <h2 class="page-header">  Manejo
            do solo </h2>
        <a class="pdf" href="/bitstream/1/doc.pdf">PDF</a>
        <p>doi:10.1590/S0100-204X2020 </p>
        </body></html>"#;

    #[test]
    fn test_rule_kinds() {
        let page = ParsedPage::parse(PAGE);
        let eval = |rule: &str| rule.parse::<SelectorRule>().unwrap().evaluate(&page);

        assert_eq!(eval("css:h2.page-header"), vec!["Manejo do solo"]);
        assert_eq!(eval("attr:a.pdf@href"), vec!["/bitstream/1/doc.pdf"]);
        assert_eq!(eval("meta:dc.TITLE"), vec!["Manejo do solo"]);
        assert_eq!(eval("meta:og:title"), vec!["OG title"]);
        assert_eq!(eval("regex:doi:(10\\.\\d+/\\S+)"), vec!["10.1590/S0100-204X2020"]);
    }

    #[test]
    fn test_rule_parse_errors() {
        assert!("h2".parse::<SelectorRule>().is_err());
        assert!("css:".parse::<SelectorRule>().is_err());
        assert!("xpath://a".parse::<SelectorRule>().is_err());
        assert!("attr:a".parse::<SelectorRule>().is_err());
        assert!("css:a[[".parse::<SelectorRule>().is_err());
        assert!("regex:(".parse::<SelectorRule>().is_err());
    }

    #[test]
    fn test_chain_first_non_empty_rule_wins() {
        let page = ParsedPage::parse(PAGE);
        let chain =
            SelectorChain::parse(["meta:citation_title", "css:h1", "meta:DC.title", "css:h2"])
                .unwrap();
        let (rule, values) = chain.evaluate(&page).unwrap();
        assert_eq!(rule.to_string(), "meta:DC.title");
        assert_eq!(values, vec!["Manejo do solo"]);
    }

    #[test]
    fn test_chain_list_values() {
        let page = ParsedPage::parse(PAGE);
        let chain = SelectorChain::parse(["meta:DC.creator", "meta:citation_author"]).unwrap();
        assert_eq!(chain.all(&page), vec!["Silva, A.", "Souza, B."]);
        assert_eq!(chain.first(&page).as_deref(), Some("Silva, A."));
    }

    #[test]
    fn test_chain_no_match() {
        let page = ParsedPage::parse(PAGE);
        let chain = SelectorChain::parse(["css:table.missing"]).unwrap();
        assert!(chain.first(&page).is_none());
        assert!(chain.all(&page).is_empty());
    }

    #[test]
    fn test_chain_rejects_empty() {
        assert!(SelectorChain::parse(Vec::<&str>::new()).is_err());
    }

    #[test]
    fn test_chain_deserializes_from_string_list() {
        #[derive(Deserialize)]
        struct Wrapper {
            title: SelectorChain,
        }
        let parsed: Wrapper = toml::from_str(r#"title = ["meta:DC.title", "css:h2"]"#).unwrap();
        assert_eq!(parsed.title.rules().len(), 2);

        let bad = toml::from_str::<Wrapper>(r#"title = ["bogus"]"#);
        assert!(bad.is_err());
    }
}
