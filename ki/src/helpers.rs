use crate::paths::ExtantFile;
use crate::Error;
use fancy_regex::Regex;
use pulldown_cmark::{html, Parser};
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

/// Matches field text that already carries HTML markup (tags or entities).
pub static HTML_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"</?\s*[a-z-][^>]*\s*>|(&(?:[\w\d]+|#\d+|#x[a-f\d]+);)").unwrap()
});

static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^<]+?>").unwrap());

pub fn has_html(text: &str) -> bool {
    HTML_REGEX.is_match(text).unwrap_or(false)
}

pub fn strip_html_tags(text: &str) -> String {
    TAG_REGEX.replace_all(text, "").into_owned()
}

/// Hex md5 of the file contents.
pub fn md5_of_file(file: &ExtantFile) -> Result<String, Error> {
    let bytes = std::fs::read(file.as_path()).map_err(|e| Error::Io {
        description: format!("Failed to read {}", file.as_path().display()),
        source: e,
    })?;
    Ok(format!("{:x}", md5::compute(bytes)))
}

pub fn md5_hex(data: &str) -> String {
    format!("{:x}", md5::compute(data.as_bytes()))
}

/// NFKC-normalize, lowercase, drop everything that is not alphanumeric,
/// whitespace, dash or underscore, collapse whitespace/dash runs to a single
/// dash, and trim leading/trailing dashes and underscores.
pub fn slugify(value: &str) -> String {
    let normalized: String = value.nfkc().collect::<String>().to_lowercase();
    let kept: String = normalized
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-' || *c == '_')
        .collect();
    let mut slug = String::with_capacity(kept.len());
    let mut in_run = false;
    for c in kept.chars() {
        if c.is_whitespace() || c == '-' {
            in_run = true;
        } else {
            if in_run && !slug.is_empty() {
                slug.push('-');
            }
            in_run = false;
            slug.push(c);
        }
    }
    slug.trim_matches(|c| c == '-' || c == '_').to_string()
}

/// A string id unique per (note, field) pair, used to name spilled HTML.
pub fn field_note_id(nid: i64, fieldname: &str) -> String {
    format!("{}{}", nid, slugify(fieldname))
}

/// Convert a plain-text field body to the HTML stored in the collection.
/// Text that already contains markup is passed through untouched.
pub fn plain_to_html(text: &str) -> String {
    if has_html(text) {
        return text.to_string();
    }
    text.replace('\n', "<br/>")
}

pub fn markdown_to_html(text: &str) -> String {
    let mut out = String::new();
    html::push_html(&mut out, Parser::new(text));
    out.trim_end_matches('\n').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_html_heuristic() {
        assert!(has_html("<b>bold</b>"));
        assert!(has_html("x &amp; y"));
        assert!(!has_html("plain text"));
        assert!(!has_html("a < b and c > d"));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello, World!"), "hello-world");
        assert_eq!(slugify("  --spaced out--  "), "spaced-out");
        assert_eq!(slugify("r"), "r");
        assert_eq!(slugify("Straße"), "straße");
        assert_eq!(slugify("a_b"), "a_b");
        assert_eq!(slugify("ﬁne"), "fine");
    }

    #[test]
    fn test_strip_html_tags() {
        assert_eq!(strip_html_tags("<b>r</b>"), "r");
        assert_eq!(strip_html_tags("no tags"), "no tags");
    }

    #[test]
    fn test_plain_to_html() {
        assert_eq!(plain_to_html("r"), "r");
        assert_eq!(plain_to_html("a\nb"), "a<br/>b");
        assert_eq!(plain_to_html("<i>kept</i>"), "<i>kept</i>");
    }

    #[test]
    fn test_markdown_to_html() {
        assert_eq!(markdown_to_html("*hi*"), "<p><em>hi</em></p>");
    }
}
