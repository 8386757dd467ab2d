//! Prompts for vision transcription and text refinement.
//!
//! Both prompts ask for the same JSON shape, `{"pages": [PageContent…]}`, so
//! one parser handles both responses. The schema text lives here and nowhere
//! else; [`crate::pipeline::parse`] decodes whatever comes back leniently.

use crate::output::PageContent;

/// Per-job prompt knobs, taken from [`crate::TranscriptionRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptOptions {
    /// Output language hint (e.g. "German"). `None` keeps the source language.
    pub language: Option<String>,
    pub preserve_formatting: bool,
    pub include_image_descriptions: bool,
}

/// JSON schema block shared by both prompts.
const PAGE_SCHEMA: &str = r#"{
  "pages": [
    {
      "page_number": 1,
      "text": "full page content as Markdown",
      "has_heading": true,
      "heading_text": "most prominent heading on the page, or empty",
      "heading_level": 1,
      "is_chapter_start": false,
      "chapter_title": "chapter title if this page starts a chapter, or empty",
      "images": ["short description of each figure or photo"]
    }
  ]
}"#;

/// Instruction prompt for a batch of `image_count` page images.
pub fn vision_prompt(opts: &PromptOptions, image_count: usize) -> String {
    let mut p = String::with_capacity(2048);
    p.push_str("You are an expert document transcriber. ");
    if image_count == 1 {
        p.push_str("You are given one page image of a document.\n\n");
    } else {
        p.push_str(&format!(
            "You are given {image_count} page images of a document, in reading order.\n\n"
        ));
    }

    p.push_str(
        "For EACH image, in the order given, transcribe all visible text into clean Markdown:\n\
         - Preserve reading order, paragraphs, lists and tables (GFM pipe tables)\n\
         - Use # for chapter titles and ## / ### for sections\n\
         - Omit running headers, footers and page numbers\n\
         - Do not invent content that is not on the page\n",
    );

    if opts.preserve_formatting {
        p.push_str(
            "- Preserve emphasis (**bold**, *italic*), indentation, line breaks in verse \
             and code, and the original numbering of lists and footnotes\n",
        );
    }

    if opts.include_image_descriptions {
        p.push_str(
            "- For every figure, chart or photo add a one-sentence description to `images`\n",
        );
    } else {
        p.push_str("- Leave `images` empty\n");
    }

    match opts.language.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
        Some(lang) => p.push_str(&format!("- Write the transcription in {lang}\n")),
        None => p.push_str("- Keep the document's original language\n"),
    }

    p.push_str(
        "\nSet `is_chapter_start` only when the page clearly opens a new chapter or major part.\n\
         `heading_level` is the Markdown level (1-6) of `heading_text`; 0 when there is no heading.\n\n",
    );
    p.push_str(&format!(
        "Return ONLY a JSON object with exactly {image_count} entr{} in `pages`, no commentary, \
         matching this shape:\n",
        if image_count == 1 { "y" } else { "ies" }
    ));
    p.push_str(PAGE_SCHEMA);
    p
}

/// Text-only prompt asking the model to clean up already transcribed pages.
pub fn refinement_prompt(pages: &[PageContent], opts: &PromptOptions) -> String {
    let mut p = String::with_capacity(1024 + pages.iter().map(|pg| pg.text.len() + 32).sum::<usize>());
    p.push_str(
        "You are an expert editor. The pages below were transcribed from scanned images \
         and may contain OCR artefacts: broken words, stray characters, wrong line breaks, \
         garbled tables or inconsistent heading levels.\n\n\
         Fix those artefacts and re-emit each page as clean Markdown. Do not summarise, \
         reorder, merge or split pages, and do not add content.\n",
    );
    if opts.preserve_formatting {
        p.push_str("Keep the existing emphasis, list numbering and line structure.\n");
    }
    if let Some(lang) = opts.language.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
        p.push_str(&format!("The text must be in {lang}.\n"));
    }
    p.push_str(&format!(
        "\nReturn ONLY a JSON object with exactly {} entries in `pages`, in the same order, \
         matching this shape:\n{PAGE_SCHEMA}\n\n",
        pages.len()
    ));

    for page in pages {
        p.push_str(&format!("--- Page {} ---\n", page.page_number));
        p.push_str(page.text.trim());
        p.push_str("\n\n");
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vision_prompt_counts_images() {
        let p = vision_prompt(&PromptOptions::default(), 3);
        assert!(p.contains("3 page images"));
        assert!(p.contains("exactly 3 entries"));
        assert!(p.contains("\"pages\""));
        assert!(p.contains("original language"));
    }

    #[test]
    fn vision_prompt_single_image_grammar() {
        let p = vision_prompt(&PromptOptions::default(), 1);
        assert!(p.contains("one page image"));
        assert!(p.contains("exactly 1 entry"));
    }

    #[test]
    fn vision_prompt_options() {
        let opts = PromptOptions {
            language: Some("German".into()),
            preserve_formatting: true,
            include_image_descriptions: true,
        };
        let p = vision_prompt(&opts, 2);
        assert!(p.contains("in German"));
        assert!(p.contains("**bold**"));
        assert!(p.contains("one-sentence description"));
    }

    #[test]
    fn refinement_prompt_groups_by_page() {
        let pages = vec![PageContent::raw(4, "Th e quick"), PageContent::raw(5, "brown fox")];
        let p = refinement_prompt(&pages, &PromptOptions::default());
        assert!(p.contains("--- Page 4 ---\nTh e quick"));
        assert!(p.contains("--- Page 5 ---\nbrown fox"));
        assert!(p.contains("exactly 2 entries"));
    }
}
