//! In-band rendering of build and startup failures.
//!
//! The page replaces whatever the app would have served, so it has to be
//! self-contained: no external stylesheets, no scripts.

use std::fmt::Write as _;

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::build::CompileError;

/// Body format chosen from the request's `Accept` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Html,
    Json,
    Text,
}

impl Format {
    /// First recognised media type wins; HTML otherwise.
    pub fn negotiate(headers: &HeaderMap) -> Self {
        let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
            return Self::Html;
        };
        for media in accept.split(',') {
            let media = media.split(';').next().unwrap_or("").trim();
            match media {
                "text/html" | "application/xhtml+xml" => return Self::Html,
                "application/json" => return Self::Json,
                "text/plain" => return Self::Text,
                _ => {}
            }
        }
        Self::Html
    }
}

/// Full response for a failed build or startup.
pub fn error_response(err: &CompileError, format: Format) -> Response {
    let status =
        StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let (content_type, body) = match format {
        Format::Html => ("text/html; charset=utf-8", html(err)),
        Format::Json => ("application/json", json(err)),
        Format::Text => ("text/plain; charset=utf-8", text(err)),
    };
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
        body,
    )
        .into_response()
}

/// Minimal text response for failures that are not the app's fault.
pub fn plain_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )],
        format!("{message}\n"),
    )
        .into_response()
}

pub fn html(err: &CompileError) -> String {
    let mut out = String::new();
    let title = escape(&err.title);
    let _ = write!(
        out,
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title>\
<style>\
body{{font-family:sans-serif;margin:0;background:#fafafa}}\
header{{background:#c0392b;color:#fff;padding:1em 2em}}\
header h1{{margin:0;font-size:1.4em}}\
section{{padding:1em 2em}}\
pre{{background:#fff;border:1px solid #ddd;padding:.5em 0;overflow:auto}}\
.line{{display:block;padding:0 1em}}\
.line.error{{background:#fdd;font-weight:bold}}\
.num{{color:#999;display:inline-block;width:4em}}\
</style></head><body>\n"
    );
    let _ = writeln!(out, "<header><h1>{title}</h1>");
    let _ = writeln!(out, "<p>{}</p></header>", escape(&err.summary));
    out.push_str("<section>\n");

    if let Some(description) = &err.description {
        let _ = writeln!(out, "<p class=\"description\">{}</p>", escape(description));
    }

    if let (Some(path), Some(line)) = (&err.path, err.line) {
        let location = format!("{}:{}", escape(path), line);
        match &err.link {
            Some(link) => {
                let _ = writeln!(
                    out,
                    "<p>In <a href=\"{}\">{location}</a></p>",
                    escape(link)
                );
            }
            None => {
                let _ = writeln!(out, "<p>In {location}</p>");
            }
        }
    }

    let context = err.context_source();
    if !context.is_empty() {
        out.push_str("<pre>");
        for line in &context {
            let class = if line.is_error { "line error" } else { "line" };
            let _ = write!(
                out,
                "<span class=\"{class}\"><span class=\"num\">{}</span>{}</span>",
                line.number,
                escape(&line.text)
            );
        }
        out.push_str("</pre>\n");
    }

    if let Some(meta) = &err.meta_error {
        let _ = writeln!(out, "<p class=\"meta\">Additionally, an error occurred: {}</p>", escape(meta));
    }

    out.push_str("</section></body></html>\n");
    out
}

pub fn text(err: &CompileError) -> String {
    let mut out = format!("{}\n\n{}\n", err.title, err.summary);
    if let Some(description) = &err.description {
        let _ = writeln!(out, "{description}");
    }
    if let (Some(path), Some(line)) = (&err.path, err.line) {
        let _ = writeln!(out, "\n{path}:{line}");
    }
    for line in err.context_source() {
        let marker = if line.is_error { '>' } else { ' ' };
        let _ = writeln!(out, "{marker}{:>5} | {}", line.number, line.text);
    }
    if let Some(link) = &err.link {
        let _ = writeln!(out, "\n{link}");
    }
    out
}

pub fn json(err: &CompileError) -> String {
    serde_json::json!({ "error": err }).to_string()
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
