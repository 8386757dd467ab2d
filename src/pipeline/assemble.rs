//! Document assembly: ordered pages → Markdown documents.
//!
//! Three layouts:
//!
//! | Mode | Documents | File names |
//! |------|-----------|------------|
//! | [`OutputMode::PerPage`] | one per page | `page_001.md`, `page_002.md`, … |
//! | [`OutputMode::Combined`] | one | `document.md` |
//! | [`OutputMode::Chapters`] | one per detected chapter | `01_introduction.md`, … |
//!
//! Chapter mode falls back to a single combined document when no chapter
//! boundary is found, so it never yields zero documents for non-empty input.

use crate::output::{ChapterInfo, MarkdownDocument, PageContent, Section};
use crate::pipeline::postprocess::tidy_markdown;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Separator between pages in combined and chapter documents.
pub const PAGE_SEPARATOR: &str = "\n\n---\n\n";

/// Stem cap in UTF-8 bytes. Leaves room for the `NN_` prefix and `.md`
/// under the usual 255-byte file name limit.
const MAX_STEM_BYTES: usize = 200;

/// How pages are grouped into files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    #[default]
    PerPage,
    Combined,
    Chapters,
}

impl OutputMode {
    /// Chapter detection takes precedence over combining.
    pub fn from_flags(detect_chapters: bool, combine_pages: bool) -> Self {
        match (detect_chapters, combine_pages) {
            (true, _) => Self::Chapters,
            (false, true) => Self::Combined,
            (false, false) => Self::PerPage,
        }
    }
}

/// Options for [`assemble`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssembleOptions {
    pub mode: OutputMode,
    /// Append image descriptions as `> *Image: …*` lines.
    pub include_image_descriptions: bool,
}

/// Build the output documents. `pages` must be in page order.
pub fn assemble(pages: &[PageContent], opts: AssembleOptions) -> Vec<MarkdownDocument> {
    if pages.is_empty() {
        return Vec::new();
    }

    let docs = match opts.mode {
        OutputMode::PerPage => per_page(pages, opts),
        OutputMode::Combined => vec![combined(pages, opts)],
        OutputMode::Chapters => {
            let chapters = detect_chapters(pages);
            if chapters.is_empty() {
                info!("No chapter boundaries found; writing one combined document");
                vec![combined(pages, opts)]
            } else {
                by_chapter(pages, &chapters, opts)
            }
        }
    };

    debug!("Assembled {} document(s) from {} page(s)", docs.len(), pages.len());
    docs
}

/// Find chapter boundaries in one forward pass.
///
/// A page opens a chapter when it is flagged `is_chapter_start` or carries a
/// level 1 or 2 heading. Each chapter runs until the page before the next
/// boundary; the last one runs to the final page. Pages before the first
/// boundary belong to the first chapter. Returns an empty list when there is
/// no boundary at all.
pub fn detect_chapters(pages: &[PageContent]) -> Vec<ChapterInfo> {
    let mut chapters: Vec<ChapterInfo> = Vec::new();

    for (i, page) in pages.iter().enumerate() {
        if !is_boundary(page) {
            continue;
        }
        if let Some(prev) = chapters.last_mut() {
            prev.end_page = page.page_number.saturating_sub(1).max(prev.start_page);
        }
        chapters.push(ChapterInfo {
            title: chapter_title(page, chapters.len() + 1),
            start_page: if chapters.is_empty() {
                pages[0].page_number
            } else {
                page.page_number
            },
            end_page: page.page_number,
            level: if (1..=2).contains(&page.heading_level) {
                page.heading_level
            } else {
                1
            },
        });
        debug!("Chapter boundary at page {} (index {})", page.page_number, i);
    }

    if let (Some(last), Some(final_page)) = (chapters.last_mut(), pages.last()) {
        last.end_page = final_page.page_number;
    }
    chapters
}

fn is_boundary(page: &PageContent) -> bool {
    page.is_chapter_start || (page.has_heading && (1..=2).contains(&page.heading_level))
}

fn chapter_title(page: &PageContent, ordinal: usize) -> String {
    let explicit = page.chapter_title.trim();
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    page.heading()
        .map(str::to_string)
        .unwrap_or_else(|| format!("Chapter {ordinal}"))
}

/// Turn a title into a safe, lower-case file stem.
///
/// Path separators, `:*?"<>|`, control characters and whitespace become `_`;
/// runs of `_` collapse; leading/trailing `_` and `.` are trimmed; the result
/// is capped at 200 bytes on a character boundary. Returns
/// `document` when nothing is left.
pub fn sanitize_filename(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in title.chars() {
        let mapped = if c.is_control()
            || c.is_whitespace()
            || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
        {
            '_'
        } else {
            c
        };
        if mapped == '_' && out.ends_with('_') {
            continue;
        }
        out.push(mapped);
    }

    let trimmed = out.trim_matches(|c| c == '_' || c == '.');
    // Lower-casing can lengthen the text, so cap again afterwards.
    let lowered = truncate_at_char_boundary(trimmed, MAX_STEM_BYTES).to_lowercase();
    let stem = truncate_at_char_boundary(&lowered, MAX_STEM_BYTES)
        .trim_end_matches(|c| c == '_' || c == '.');

    if stem.is_empty() {
        "document".to_string()
    } else {
        stem.to_string()
    }
}

fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Rendered Markdown body of one page.
fn page_body(page: &PageContent, opts: AssembleOptions) -> String {
    let mut body = tidy_markdown(&page.text);
    if opts.include_image_descriptions {
        for desc in &page.images {
            let desc = desc.trim();
            if desc.is_empty() {
                continue;
            }
            if !body.is_empty() {
                body.push_str("\n\n");
            }
            body.push_str(&format!("> *Image: {desc}*"));
        }
    }
    body
}

static RE_ATX_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(#{1,6})[ \t]+(.+?)[ \t#]*$").unwrap());

/// Headings found in `body`, falling back to the page's own heading hint.
fn page_sections(page: &PageContent, body: &str) -> Vec<Section> {
    let mut in_fence = false;
    let mut sections = Vec::new();
    for line in body.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(caps) = RE_ATX_HEADING.captures(line) {
            sections.push(Section {
                title: caps[2].trim().to_string(),
                level: caps[1].len() as u8,
                page: page.page_number,
            });
        }
    }

    if sections.is_empty() {
        if let Some(h) = page.heading() {
            sections.push(Section {
                title: h.to_string(),
                level: page.heading_level.clamp(1, 6),
                page: page.page_number,
            });
        }
    }
    sections
}

fn page_range(pages: &[PageContent]) -> (usize, usize) {
    match (pages.first(), pages.last()) {
        (Some(a), Some(b)) => (a.page_number, b.page_number),
        _ => (0, 0),
    }
}

fn join_pages(pages: &[PageContent], opts: AssembleOptions) -> (String, Vec<Section>) {
    let mut bodies = Vec::with_capacity(pages.len());
    let mut sections = Vec::new();
    for page in pages {
        let body = page_body(page, opts);
        sections.extend(page_sections(page, &body));
        bodies.push(body);
    }
    let mut content = bodies.join(PAGE_SEPARATOR);
    content.push('\n');
    (content, sections)
}

fn per_page(pages: &[PageContent], opts: AssembleOptions) -> Vec<MarkdownDocument> {
    pages
        .iter()
        .map(|page| {
            let (content, sections) = join_pages(std::slice::from_ref(page), opts);
            MarkdownDocument {
                filename: format!("page_{:03}.md", page.page_number),
                title: page
                    .heading()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Page {}", page.page_number)),
                content,
                page_range: (page.page_number, page.page_number),
                sections,
            }
        })
        .collect()
}

fn combined(pages: &[PageContent], opts: AssembleOptions) -> MarkdownDocument {
    let (content, sections) = join_pages(pages, opts);
    MarkdownDocument {
        filename: "document.md".to_string(),
        title: pages
            .iter()
            .find_map(PageContent::heading)
            .unwrap_or("Document")
            .to_string(),
        content,
        page_range: page_range(pages),
        sections,
    }
}

fn by_chapter(
    pages: &[PageContent],
    chapters: &[ChapterInfo],
    opts: AssembleOptions,
) -> Vec<MarkdownDocument> {
    chapters
        .iter()
        .enumerate()
        .map(|(i, chapter)| {
            let members: Vec<PageContent> = pages
                .iter()
                .filter(|p| (chapter.start_page..=chapter.end_page).contains(&p.page_number))
                .cloned()
                .collect();
            let (content, sections) = join_pages(&members, opts);
            MarkdownDocument {
                filename: format!("{:02}_{}.md", i + 1, sanitize_filename(&chapter.title)),
                title: chapter.title.clone(),
                content,
                page_range: (chapter.start_page, chapter.end_page),
                sections,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: usize, text: &str) -> PageContent {
        PageContent::raw(n, text)
    }

    fn heading(n: usize, title: &str, level: u8) -> PageContent {
        PageContent {
            page_number: n,
            text: format!("{} {title}\n\nBody of page {n}", "#".repeat(level as usize)),
            has_heading: true,
            heading_text: title.into(),
            heading_level: level,
            ..Default::default()
        }
    }

    #[test]
    fn mode_precedence() {
        assert_eq!(OutputMode::from_flags(true, true), OutputMode::Chapters);
        assert_eq!(OutputMode::from_flags(false, true), OutputMode::Combined);
        assert_eq!(OutputMode::from_flags(false, false), OutputMode::PerPage);
    }

    #[test]
    fn per_page_names_and_titles() {
        let pages = vec![heading(1, "Intro", 1), page(2, "plain")];
        let docs = assemble(&pages, AssembleOptions::default());
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].filename, "page_001.md");
        assert_eq!(docs[0].title, "Intro");
        assert_eq!(docs[1].title, "Page 2");
        assert_eq!(docs[1].content, "plain\n");
        assert_eq!(docs[1].page_range, (2, 2));
    }

    #[test]
    fn combined_joins_with_separator() {
        let pages = vec![page(1, "one"), heading(2, "Second", 2), page(3, "three")];
        let docs = assemble(
            &pages,
            AssembleOptions {
                mode: OutputMode::Combined,
                ..Default::default()
            },
        );
        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc.filename, "document.md");
        assert_eq!(doc.title, "Second");
        assert_eq!(doc.page_range, (1, 3));
        assert!(doc.content.starts_with("one\n\n---\n\n## Second"));
        assert!(doc.content.ends_with("three\n"));
        assert_eq!(
            doc.sections,
            vec![Section {
                title: "Second".into(),
                level: 2,
                page: 2
            }]
        );
    }

    #[test]
    fn combined_default_title() {
        let docs = assemble(
            &[page(1, "x")],
            AssembleOptions {
                mode: OutputMode::Combined,
                ..Default::default()
            },
        );
        assert_eq!(docs[0].title, "Document");
    }

    #[test]
    fn chapters_cover_every_page() {
        let pages = vec![
            page(1, "front matter"),
            heading(2, "Getting Started", 1),
            page(3, "more"),
            heading(4, "Deep Dive: Part/2", 2),
            page(5, "end"),
        ];
        let chapters = detect_chapters(&pages);
        assert_eq!(chapters.len(), 2);
        assert_eq!((chapters[0].start_page, chapters[0].end_page), (1, 3));
        assert_eq!((chapters[1].start_page, chapters[1].end_page), (4, 5));
        assert_eq!(chapters[1].level, 2);

        let docs = assemble(
            &pages,
            AssembleOptions {
                mode: OutputMode::Chapters,
                ..Default::default()
            },
        );
        assert_eq!(docs[0].filename, "01_getting_started.md");
        assert_eq!(docs[1].filename, "02_deep_dive_part_2.md");
        assert!(docs[0].content.starts_with("front matter"));
        assert_eq!(docs.iter().map(|d| d.content.matches("---").count()).sum::<usize>(), 3);
    }

    #[test]
    fn level_three_heading_is_not_a_boundary() {
        let pages = vec![heading(1, "Minor", 3), page(2, "x")];
        assert!(detect_chapters(&pages).is_empty());
    }

    #[test]
    fn explicit_chapter_flag_and_title() {
        let mut p = page(1, "CHAPTER ONE");
        p.is_chapter_start = true;
        p.chapter_title = "The Beginning".into();
        let chapters = detect_chapters(&[p, page(2, "y")]);
        assert_eq!(chapters[0].title, "The Beginning");
        assert_eq!(chapters[0].end_page, 2);
    }

    #[test]
    fn chapters_fall_back_to_combined() {
        let docs = assemble(
            &[page(1, "a"), page(2, "b")],
            AssembleOptions {
                mode: OutputMode::Chapters,
                ..Default::default()
            },
        );
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].filename, "document.md");
        assert_eq!(docs[0].content, "a\n\n---\n\nb\n");
    }

    #[test]
    fn image_descriptions_are_quoted() {
        let mut p = page(1, "text");
        p.images = vec!["A pie chart".into()];
        let with = assemble(
            &[p.clone()],
            AssembleOptions {
                include_image_descriptions: true,
                ..Default::default()
            },
        );
        assert_eq!(with[0].content, "text\n\n> *Image: A pie chart*\n");
        let without = assemble(&[p], AssembleOptions::default());
        assert_eq!(without[0].content, "text\n");
    }

    #[test]
    fn sanitize_rules() {
        assert_eq!(sanitize_filename("Hello World"), "hello_world");
        assert_eq!(sanitize_filename("a / b \\ c"), "a_b_c");
        assert_eq!(sanitize_filename("..Intro: <Part> 1?.."), "intro_part_1");
        assert_eq!(sanitize_filename("   "), "document");
        assert_eq!(sanitize_filename("tab\there\u{7}"), "tab_here");
        assert_eq!(sanitize_filename(&"x".repeat(300)).len(), 200);
    }

    #[test]
    fn stem_cap_counts_bytes() {
        let stem = sanitize_filename(&"第".repeat(95));
        assert!(stem.len() <= 200);
        assert!(stem.chars().all(|c| c == '第'));

        // 'İ' lower-cases to two chars and grows from 2 to 3 bytes.
        let grown = sanitize_filename(&"İ".repeat(150));
        assert!(grown.len() <= 200);
        assert!(!grown.is_empty());
    }

    #[tokio::test]
    async fn long_non_ascii_chapter_title_is_writable() {
        let title = "第".repeat(95);
        let pages = vec![heading(1, &title, 1), page(2, "more")];
        let docs = assemble(
            &pages,
            AssembleOptions {
                mode: OutputMode::Chapters,
                ..Default::default()
            },
        );
        assert_eq!(docs.len(), 1);
        assert!(docs[0].filename.len() <= 255);
        assert_eq!(docs[0].title, title);

        let tmp = tempfile::tempdir().unwrap();
        let written = crate::output::write_documents(&docs, tmp.path()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&written[0]).unwrap(), docs[0].content);
    }

    #[test]
    fn sections_skip_code_fences() {
        let p = page(1, "# Real\n\n```\n# not a heading\n```\n\n### Sub ###");
        let docs = assemble(&[p], AssembleOptions::default());
        let titles: Vec<_> = docs[0].sections.iter().map(|s| (s.title.as_str(), s.level)).collect();
        assert_eq!(titles, vec![("Real", 1), ("Sub", 3)]);
    }

    #[test]
    fn empty_pages_yield_no_documents() {
        assert!(assemble(&[], AssembleOptions::default()).is_empty());
    }
}
