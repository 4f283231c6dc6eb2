//! Markup rewriting and resource scanning for direct renders.
//!
//! Direct mode injects markup into a page that has no file-system origin, so any
//! `./resources/...` reference has to be rebased onto the virtual base URL the page is
//! served under. The same URL base lets the resource cache answer those requests.

use crate::resource_cache::{extract_file_name, is_static_resource};
use regex::{Captures, Regex};
use std::collections::HashSet;
use std::sync::OnceLock;

fn head_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<head[^>]*>").expect("Invalid head regex"))
}

fn relative_resource_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(href|src)=["']\./resources/([^"']+)["']"#)
            .expect("Invalid resource regex")
    })
}

/// Pattern: `src="..."` / `href='...'`
///
/// Group 1 is the attribute value.
fn attribute_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\b(?:src|href)\s*=\s*["']([^"']+)["']"#)
            .expect("Invalid attribute regex")
    })
}

/// Pattern: `url(...)` with optional quotes
fn css_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)url\(\s*["']?([^"')\s]+)["']?\s*\)"#).expect("Invalid url() regex")
    })
}

/// Rebases relative resource links onto `base_url` and inserts a `<base>` tag.
///
/// The `<base>` tag only goes in when the markup has none and has a `<head>` to put it in.
///
/// # Examples
///
/// ```rust
/// use markup_render::markup::prepare_direct_markup;
///
/// let html = r#"<html><head></head><body><img src="./resources/a.png"></body></html>"#;
/// let out = prepare_direct_markup(html, "http://127.0.0.1:8080");
/// assert!(out.contains(r#"<base href="http://127.0.0.1:8080/">"#));
/// assert!(out.contains(r#"src="http://127.0.0.1:8080/resources/a.png""#));
/// ```
pub fn prepare_direct_markup(html: &str, base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');

    let mut output = if html.contains("<base") {
        html.to_string()
    } else if let Some(head) = head_regex().find(html) {
        let mut with_base = String::with_capacity(html.len() + base.len() + 16);
        with_base.push_str(&html[..head.end()]);
        with_base.push_str(&format!("<base href=\"{base}/\">"));
        with_base.push_str(&html[head.end()..]);
        with_base
    } else {
        html.to_string()
    };

    output = relative_resource_regex()
        .replace_all(&output, |caps: &Captures| {
            format!("{}=\"{}/resources/{}\"", &caps[1], base, &caps[2])
        })
        .into_owned();

    output
}

/// Collects the local static resources a document references.
///
/// Returns basenames in first-seen order without duplicates. Remote, protocol-relative,
/// `data:` and fragment references are skipped because the cache never serves them under
/// a virtual base.
pub fn scan_resources(html: &str) -> Vec<String> {
    let mut found: Vec<(usize, &str)> = attribute_regex()
        .captures_iter(html)
        .chain(css_url_regex().captures_iter(html))
        .filter_map(|caps| caps.get(1))
        .map(|value| (value.start(), value.as_str()))
        .collect();
    found.sort_by_key(|(position, _)| *position);

    let mut seen = HashSet::new();
    let mut resources = Vec::new();

    for (_, reference) in found {
        if is_external_reference(reference) || !is_static_resource(reference) {
            continue;
        }

        let name = extract_file_name(reference);
        if !name.is_empty() && seen.insert(name.clone()) {
            resources.push(name);
        }
    }

    resources
}

fn is_external_reference(reference: &str) -> bool {
    let lower = reference.trim().to_ascii_lowercase();
    lower.starts_with("http:")
        || lower.starts_with("https:")
        || lower.starts_with("//")
        || lower.starts_with("data:")
        || lower.starts_with("blob:")
        || lower.starts_with('#')
}

/// Prepends `<!DOCTYPE html>` unless the markup already declares one.
pub fn ensure_doctype(html: &str) -> String {
    let declared = html
        .trim_start()
        .get(..9)
        .map(|prefix| prefix.eq_ignore_ascii_case("<!doctype"))
        .unwrap_or(false);

    if declared {
        html.to_string()
    } else {
        format!("<!DOCTYPE html>\n{html}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "http://127.0.0.1:8080";

    #[test]
    fn test_inserts_base_after_head() {
        let html = r#"<html><HEAD lang="en"><title>x</title></HEAD><body></body></html>"#;
        let out = prepare_direct_markup(html, BASE);
        assert!(out.contains(r#"<HEAD lang="en"><base href="http://127.0.0.1:8080/"><title>"#));
    }

    #[test]
    fn test_keeps_existing_base() {
        let html = r#"<html><head><base href="http://other/"></head><body></body></html>"#;
        let out = prepare_direct_markup(html, BASE);
        assert_eq!(out.matches("<base").count(), 1);
        assert!(out.contains("http://other/"));
    }

    #[test]
    fn test_without_head_only_rewrites_links() {
        let html = r#"<div><img src='./resources/logo.png'></div>"#;
        let out = prepare_direct_markup(html, "http://127.0.0.1:8080/");
        assert!(!out.contains("<base"));
        assert_eq!(
            out,
            r#"<div><img src="http://127.0.0.1:8080/resources/logo.png"></div>"#
        );
    }

    #[test]
    fn test_rewrites_every_relative_resource() {
        let html = concat!(
            r#"<head></head><link href="./resources/style.css" rel="stylesheet">"#,
            r#"<script SRC="./resources/app.js"></script>"#,
            r#"<img src="./images/other.png">"#
        );
        let out = prepare_direct_markup(html, BASE);
        assert!(out.contains(r#"href="http://127.0.0.1:8080/resources/style.css""#));
        assert!(out.contains(r#"SRC="http://127.0.0.1:8080/resources/app.js""#));
        assert!(out.contains(r#"src="./images/other.png""#));
    }

    #[test]
    fn test_scan_resources_order_and_filters() {
        let html = r##"
            <link href="./resources/style.css?v=2" rel="stylesheet">
            <style>body { background: url('./resources/bg.webp'); }</style>
            <img src="https://cdn.example.com/remote.png">
            <img src="//cdn.example.com/proto.png">
            <img src="data:image/png;base64,AAAA">
            <a href="#top">top</a>
            <a href="./page.html">page</a>
            <script src="./resources/app.js"></script>
            <img src="./resources/style.css">
        "##;

        assert_eq!(
            scan_resources(html),
            vec!["style.css", "bg.webp", "app.js"]
        );
    }

    #[test]
    fn test_ensure_doctype() {
        assert_eq!(ensure_doctype("<p>x</p>"), "<!DOCTYPE html>\n<p>x</p>");
        assert_eq!(
            ensure_doctype("  <!doctype html><p>x</p>"),
            "  <!doctype html><p>x</p>"
        );
    }
}
