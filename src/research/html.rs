//! HTML to plain text.

use std::sync::LazyLock;

use regex::Regex;

static SCRIPT_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|noscript)\b[^>]*>.*?</(script|style|noscript)\s*>").unwrap()
});

static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

/// Strip tags and non-content blocks, decode common entities, collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let without_blocks = SCRIPT_STYLE.replace_all(html, " ");
    let without_comments = COMMENT.replace_all(&without_blocks, " ");

    let mut result = String::with_capacity(without_comments.len());
    let mut in_tag = false;
    for ch in without_comments.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }

    let decoded = decode_entities(&result);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Truncate to at most `max` characters on a char boundary.
pub fn excerpt(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
    }

    #[test]
    fn strip_html_nested_tags() {
        assert_eq!(
            strip_html("<div><b>Bold</b> and <i>italic</i></div>"),
            "Bold and italic"
        );
    }

    #[test]
    fn strip_html_drops_script_and_style() {
        let html = "<style>.x{color:red}</style><p>Text</p><script>alert(1)</script>";
        assert_eq!(strip_html(html), "Text");
    }

    #[test]
    fn strip_html_decodes_entities() {
        assert_eq!(strip_html("<p>a &amp; b &lt;c&gt;</p>"), "a & b <c>");
    }

    #[test]
    fn block_boundaries_keep_words_apart() {
        assert_eq!(strip_html("<p>one</p><p>two</p>"), "one two");
    }

    #[test]
    fn excerpt_respects_chars() {
        assert_eq!(excerpt("héllo", 2), "hé");
        assert_eq!(excerpt("hi", 10), "hi");
    }
}
