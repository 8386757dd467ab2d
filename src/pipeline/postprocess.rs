//! Deterministic cleanup of transcribed page text.
//!
//! Runs on every page before assembly. The rules only touch layout noise the
//! models keep producing despite the prompt; they never rewrite words.
//!
//! Order matters: line endings are normalised before anything matches on
//! `\n`, and fences are stripped before the page-number rule looks at the
//! first and last lines.

use once_cell::sync::Lazy;
use regex::Regex;

/// Clean one page of Markdown. The result has no leading or trailing blank
/// lines.
pub fn tidy_markdown(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_outer_fence(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = drop_page_number_lines(&s);
    let s = caption_placeholder_images(&s);
    let s = collapse_blank_lines(&s);
    s.trim_matches('\n').to_string()
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\n(.*)\n```$").unwrap());

/// A page wrapped entirely in a ```` ```markdown ```` fence.
fn strip_outer_fence(input: &str) -> String {
    match RE_OUTER_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}'], "")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

// A bare number is at most 3 digits so a lone year ("2024") survives;
// four digits need a "page"/"p." prefix or dashes on both sides.
static RE_PAGE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)^\s*(?:",
        r"(?:page\s+|p\.\s*)\d{1,4}(?:\s*(?:/|of)\s*\d{1,4})?",
        r"|[-–—]\s*\d{1,4}\s*[-–—]",
        r"|(?:[-–—]\s*)?\d{1,3}(?:\s*(?:/|of)\s*\d{1,4})?(?:\s*[-–—])?",
        r")\s*$"
    ))
    .unwrap()
});

/// Remove a page number ("12", "- 12 -", "Page 3 of 40") from the first or
/// last non-blank line.
fn drop_page_number_lines(input: &str) -> String {
    let mut lines: Vec<&str> = input.lines().collect();
    // Never empty a page that holds nothing but a number.
    if lines.iter().filter(|l| !l.trim().is_empty()).count() < 2 {
        return input.to_string();
    }
    if let Some(last) = lines.iter().rposition(|l| !l.trim().is_empty()) {
        if RE_PAGE_NUMBER.is_match(lines[last]) {
            lines.remove(last);
        }
    }
    if let Some(first) = lines.iter().position(|l| !l.trim().is_empty()) {
        if RE_PAGE_NUMBER.is_match(lines[first]) {
            lines.remove(first);
        }
    }
    lines.join("\n")
}

static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());

/// Image links are never real in a transcription: the page image is the only
/// source. Keep the alt text as an italic caption.
fn caption_placeholder_images(input: &str) -> String {
    RE_IMAGE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let alt = caps[1].trim();
            if alt.is_empty() {
                String::new()
            } else {
                format!("*{alt}*")
            }
        })
        .into_owned()
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").into_owned()
}
