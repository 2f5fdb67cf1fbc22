//! Content classification and text recovery.
//!
//! HTML text comes from the DOM via `scraper`. PDFs are inspected with
//! lightweight byte heuristics: text-showing operators and literal strings
//! versus page count and embedded images. Low text density means a scanned
//! document that needs OCR.

use std::sync::LazyLock;

use regex::bytes::Regex;
use regtruth_shared::ContentClass;
use scraper::{Html, Selector};

static PDF_PAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)/Type\s*/Page\b").expect("valid regex"));

static PDF_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)/Subtype\s*/Image\b").expect("valid regex"));

/// Literal strings shown by `Tj` or inside `TJ` arrays.
static PDF_SHOWN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?-u)\(((?:[^()\\]|\\.)*)\)\s*Tj|\[((?:[^\]\\]|\\.)*)\]\s*TJ").expect("valid regex")
});

static PDF_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)\(((?:[^()\\]|\\.)*)\)").expect("valid regex"));

/// Text-density signals of a PDF.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdfStats {
    pub pages: usize,
    pub images: usize,
    pub text_chars: usize,
    /// Shown text characters per byte of file.
    pub density: f64,
}

/// Decide the content class from the declared type and the bytes.
pub fn classify(content_type: Option<&str>, body: &[u8], pdf_text_density: f64) -> ContentClass {
    let declared = content_type.unwrap_or("").to_ascii_lowercase();

    if declared.contains("pdf") || body.starts_with(b"%PDF") {
        let stats = pdf_stats(body);
        if stats.text_chars > 0 && stats.density >= pdf_text_density {
            return ContentClass::TextPdf;
        }
        return ContentClass::ScannedPdf;
    }

    if declared.contains("html") || declared.contains("xhtml") || looks_like_html(body) {
        return ContentClass::Html;
    }

    ContentClass::Other
}

fn looks_like_html(body: &[u8]) -> bool {
    let head = &body[..body.len().min(512)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    let head = head.trim_start();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

pub fn pdf_stats(body: &[u8]) -> PdfStats {
    let pages = PDF_PAGE.find_iter(body).count().max(1);
    let images = PDF_IMAGE.find_iter(body).count();
    let text_chars = pdf_text(body).chars().filter(|c| !c.is_whitespace()).count();
    let density = if body.is_empty() {
        0.0
    } else {
        text_chars as f64 / body.len() as f64
    };
    PdfStats {
        pages,
        images,
        text_chars,
        density,
    }
}

/// Text shown by uncompressed content streams, one line per operator.
pub fn pdf_text(body: &[u8]) -> String {
    let mut out = String::new();
    for caps in PDF_SHOWN_TEXT.captures_iter(body) {
        if let Some(single) = caps.get(1) {
            out.push_str(&unescape_pdf(single.as_bytes()));
        } else if let Some(array) = caps.get(2) {
            for lit in PDF_LITERAL.captures_iter(array.as_bytes()) {
                if let Some(m) = lit.get(1) {
                    out.push_str(&unescape_pdf(m.as_bytes()));
                }
            }
        }
        out.push('\n');
    }
    out
}

fn unescape_pdf(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut iter = raw.iter().copied();
    while let Some(b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Visible text of an HTML document, without scripts, styles and chrome.
pub fn html_text(body: &[u8]) -> String {
    let source = String::from_utf8_lossy(body);
    let doc = Html::parse_document(&source);

    let skip_sel =
        Selector::parse("script, style, noscript, nav, header, footer").expect("valid selector");
    let root = ["main", "article", "[role=main]", "body"]
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|sel| doc.select(&sel).next());
    let Some(root) = root else {
        return String::new();
    };

    let skipped: Vec<_> = root.select(&skip_sel).map(|el| el.id()).collect();

    let mut lines = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        if node.ancestors().any(|a| skipped.contains(&a.id())) {
            continue;
        }
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            lines.push(collapsed);
        }
    }
    lines.join("\n")
}

/// Text for extraction given the class; scanned PDFs need OCR output instead.
pub fn document_text(class: ContentClass, body: &[u8]) -> Option<String> {
    match class {
        ContentClass::Html => Some(html_text(body)),
        ContentClass::TextPdf => Some(pdf_text(body)),
        ContentClass::ScannedPdf | ContentClass::Other => None,
    }
}
