//! Server Side Includes (`<!--#include virtual="…" -->` only).

use super::scanner::{self, attributes, next_tag};
use super::template::{push_include, push_literal, Include};
use super::SurrogateError;

pub(super) const INCLUDE_OPEN: &[u8] = b"<!--#include";

pub(super) fn compile(body: &[u8]) -> Result<Vec<u8>, SurrogateError> {
    let mut out = Vec::with_capacity(body.len());
    let mut pos = 0;
    while let Some(tag) = next_tag(body, pos, INCLUDE_OPEN, &[b"-->"]) {
        push_literal(&mut out, &body[pos..tag.start]);

        let src = attributes(tag.attributes)
            .into_iter()
            .find(|(name, _)| name == "virtual")
            .map(|(_, value)| value)
            .ok_or(SurrogateError::MissingAttribute {
                dialect: "SSI",
                attribute: "virtual",
            })?;
        push_include(
            &mut out,
            &Include {
                src,
                alt: None,
                ignore_errors: false,
            },
        );
        pos = tag.end;
    }
    push_literal(&mut out, &body[pos..]);
    Ok(out)
}

pub(super) fn has_include(body: &[u8]) -> bool {
    scanner::contains(body, INCLUDE_OPEN)
}

/// SSI has no fallback or error suppression, so only the URI is rendered.
pub(super) fn render_include_tag(uri: &str) -> String {
    format!("<!--#include virtual=\"{}\" -->", uri)
}
