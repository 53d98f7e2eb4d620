//! Secondary output formats.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::RenderError;
use crate::tasks::model::OutputFormat;

/// Converts a markdown artifact into another output format.
pub trait FormatRenderer: Send + Sync {
    fn render(&self, markdown: &str, format: OutputFormat) -> Result<String, RenderError>;
}

/// Dependency-free renderer: markdown as-is, plain text, minimal HTML.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicRenderer;

static HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());
static EMPHASIS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\*\*|__|\*|`)").unwrap());
static LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\(([^)]*)\)").unwrap());

impl FormatRenderer for BasicRenderer {
    /// Fails when nothing but markup survives the conversion.
    fn render(&self, markdown: &str, format: OutputFormat) -> Result<String, RenderError> {
        let rendered = match format {
            OutputFormat::Markdown => Some(markdown.to_string()),
            OutputFormat::Text => Some(to_text(markdown)).filter(|t| !t.trim().is_empty()),
            OutputFormat::Html => to_html(markdown),
        };
        rendered.ok_or(RenderError::EmptyDocument { format })
    }
}

fn to_text(markdown: &str) -> String {
    let text = HEADING.replace_all(markdown, "");
    let text = LINK.replace_all(&text, "$1 ($2)");
    EMPHASIS.replace_all(&text, "").into_owned()
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `None` when the markdown has no block to emit.
fn to_html(markdown: &str) -> Option<String> {
    let mut body = String::new();
    let mut in_list = false;
    let mut paragraph: Vec<String> = Vec::new();

    let flush = |paragraph: &mut Vec<String>, body: &mut String| {
        if !paragraph.is_empty() {
            body.push_str(&format!("<p>{}</p>\n", paragraph.join(" ")));
            paragraph.clear();
        }
    };

    for line in markdown.lines() {
        let trimmed = line.trim();
        let item = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "));

        if in_list && item.is_none() {
            body.push_str("</ul>\n");
            in_list = false;
        }

        if trimmed.is_empty() {
            flush(&mut paragraph, &mut body);
        } else if let Some(item) = item {
            flush(&mut paragraph, &mut body);
            if !in_list {
                body.push_str("<ul>\n");
                in_list = true;
            }
            body.push_str(&format!("<li>{}</li>\n", escape(item)));
        } else if trimmed.starts_with('#') {
            flush(&mut paragraph, &mut body);
            let level = trimmed.chars().take_while(|c| *c == '#').count().min(6);
            let text = trimmed[level..].trim();
            body.push_str(&format!("<h{level}>{}</h{level}>\n", escape(text)));
        } else {
            paragraph.push(escape(trimmed));
        }
    }
    flush(&mut paragraph, &mut body);
    if in_list {
        body.push_str("</ul>\n");
    }

    if body.is_empty() {
        return None;
    }
    Some(format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"></head>\n<body>\n{body}</body>\n</html>\n"
    ))
}
