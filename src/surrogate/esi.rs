//! Edge Side Includes.
//!
//! Supported subset: `<esi:include src alt onerror>`, `<esi:remove>` blocks and
//! `<esi:comment …/>` tags. Everything else in the body is passed through untouched.

use super::scanner::{self, attributes, next_tag, strip_blocks, strip_tags};
use super::template::{push_include, push_literal, Include};
use super::SurrogateError;

pub(super) const INCLUDE_OPEN: &[u8] = b"<esi:include";

/// Rewrite an ESI body into an include template.
pub(super) fn compile(body: &[u8]) -> Result<Vec<u8>, SurrogateError> {
    let body = strip_blocks(body, b"<esi:remove>", b"</esi:remove>");
    let body = strip_tags(&body, b"<esi:comment");

    let mut out = Vec::with_capacity(body.len());
    let mut pos = 0;
    while let Some(tag) = next_tag(&body, pos, INCLUDE_OPEN, &[b"/>", b"</esi:include>"]) {
        push_literal(&mut out, &body[pos..tag.start]);

        let mut include = Include {
            src: String::new(),
            alt: None,
            ignore_errors: false,
        };
        let mut has_src = false;
        for (name, value) in attributes(tag.attributes) {
            match name.as_str() {
                "src" => {
                    include.src = value;
                    has_src = true;
                }
                "alt" if !value.is_empty() => include.alt = Some(value),
                "onerror" => include.ignore_errors = value == "continue",
                _ => {}
            }
        }
        if !has_src {
            return Err(SurrogateError::MissingAttribute {
                dialect: "ESI",
                attribute: "src",
            });
        }
        push_include(&mut out, &include);
        pos = tag.end;
    }
    push_literal(&mut out, &body[pos..]);
    Ok(out)
}

pub(super) fn has_include(body: &[u8]) -> bool {
    scanner::contains(body, INCLUDE_OPEN)
}

pub(super) fn render_include_tag(uri: &str, alt: Option<&str>, ignore_errors: bool, comment: Option<&str>) -> String {
    let mut html = format!("<esi:include src=\"{}\"", uri);
    if ignore_errors {
        html.push_str(" onerror=\"continue\"");
    }
    if let Some(alt) = alt.filter(|alt| !alt.is_empty()) {
        html.push_str(&format!(" alt=\"{}\"", alt));
    }
    html.push_str(" />");

    match comment.filter(|c| !c.is_empty()) {
        Some(comment) => format!("<esi:comment text=\"{}\" />\n{}", comment, html),
        None => html,
    }
}
