//! Text extraction for stored documents.
//!
//! [`extract`] dispatches on the file extension and returns the text split
//! into pages (a single page for unpaginated formats):
//!
//! | Extension | Handling |
//! |-----------|----------|
//! | `txt md csv json xml log` | UTF-8, lossy |
//! | `html htm` | scripts, styles and tags stripped, entities decoded |
//! | `pdf` | `pdf-extract`, pages split on form feed |
//! | `docx pptx xlsx` | ZIP + `quick-xml`, bounded entry size |
//!
//! Extraction never panics; a failing file is reported and skipped by the
//! ingestion pipeline without affecting its siblings.

use quick_xml::events::Event;
use regex::Regex;
use std::io::{Cursor, Read};
use std::sync::LazyLock;

use tenant_rag_core::clean::clean_pages;

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Decompressed size limit for one OOXML part.
const MAX_PART_BYTES: u64 = 50 * 1024 * 1024;

const PLAIN_EXTENSIONS: &[&str] = &["txt", "md", "csv", "json", "xml", "log"];

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

/// Extracted document text, one entry per page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedText {
    pub pages: Vec<String>,
}

impl ExtractedText {
    fn single(text: String) -> Self {
        Self { pages: vec![text] }
    }

    /// Full text with pages joined by blank lines, plus the character
    /// offset at which each page starts. Unpaginated text yields no offsets.
    pub fn joined(&self) -> (String, Vec<usize>) {
        let mut text = String::new();
        let mut starts = Vec::with_capacity(self.pages.len());
        let mut chars = 0usize;
        for (i, page) in self.pages.iter().enumerate() {
            if i > 0 {
                text.push_str("\n\n");
                chars += 2;
            }
            starts.push(chars);
            text.push_str(page);
            chars += page.chars().count();
        }
        if self.pages.len() <= 1 {
            starts.clear();
        }
        (text, starts)
    }

    pub fn is_blank(&self) -> bool {
        self.pages.iter().all(|p| p.trim().is_empty())
    }
}

/// Whether `path` has an extension [`extract`] understands.
pub fn is_supported(path: &str) -> bool {
    let ext = extension(path);
    PLAIN_EXTENSIONS.contains(&ext.as_str())
        || matches!(ext.as_str(), "html" | "htm" | "pdf" | "docx" | "pptx" | "xlsx")
}

/// Extract text from `bytes` based on `path`'s extension, optionally cleaned.
pub fn extract(path: &str, bytes: &[u8], clean: bool) -> Result<ExtractedText, ExtractError> {
    let ext = extension(path);
    let extracted = match ext.as_str() {
        e if PLAIN_EXTENSIONS.contains(&e) => {
            ExtractedText::single(String::from_utf8_lossy(bytes).into_owned())
        }
        "html" | "htm" => ExtractedText::single(html_to_text(&String::from_utf8_lossy(bytes))),
        "pdf" => extract_pdf(bytes)?,
        "docx" => ExtractedText::single(extract_docx(bytes)?),
        "pptx" => ExtractedText::single(extract_pptx(bytes)?),
        "xlsx" => ExtractedText::single(extract_xlsx(bytes)?),
        _ => return Err(ExtractError::Unsupported(path.to_string())),
    };
    if clean {
        Ok(ExtractedText {
            pages: clean_pages(&extracted.pages),
        })
    } else {
        Ok(extracted)
    }
}

fn extension(path: &str) -> String {
    path.rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .filter(|e| !e.contains('/'))
        .unwrap_or_default()
}

static SCRIPT_STYLE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>").ok());
static BLOCK_TAG: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(p|div|br|li|tr|h[1-6]|section|article|table|ul|ol)\b[^>]*>").ok()
});
static ANY_TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").ok());

/// Strip markup from an HTML page, keeping block boundaries as newlines.
pub fn html_to_text(html: &str) -> String {
    let mut text = html.to_string();
    if let Some(re) = SCRIPT_STYLE.as_ref() {
        text = re.replace_all(&text, " ").into_owned();
    }
    if let Some(re) = BLOCK_TAG.as_ref() {
        text = re.replace_all(&text, "\n").into_owned();
    }
    if let Some(re) = ANY_TAG.as_ref() {
        text = re.replace_all(&text, "").into_owned();
    }
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn extract_pdf(bytes: &[u8]) -> Result<ExtractedText, ExtractError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let mut pages: Vec<String> = text.split('\u{c}').map(str::to_string).collect();
    // trailing form feed
    while pages.len() > 1 && pages.last().is_some_and(|p| p.trim().is_empty()) {
        pages.pop();
    }
    Ok(ExtractedText { pages })
}

/// An opened OOXML container (docx, pptx, xlsx).
struct OoxmlPackage<'a> {
    archive: zip::ZipArchive<Cursor<&'a [u8]>>,
}

impl<'a> OoxmlPackage<'a> {
    fn open(bytes: &'a [u8]) -> Result<Self, ExtractError> {
        let archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(ooxml_err)?;
        Ok(Self { archive })
    }

    /// Read one part, refusing parts that inflate past [`MAX_PART_BYTES`].
    fn part(&mut self, name: &str) -> Result<Vec<u8>, ExtractError> {
        let entry = self
            .archive
            .by_name(name)
            .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
        let mut out = Vec::new();
        entry
            .take(MAX_PART_BYTES + 1)
            .read_to_end(&mut out)
            .map_err(ooxml_err)?;
        if out.len() as u64 > MAX_PART_BYTES {
            return Err(ExtractError::Ooxml(format!("{} is larger than {} bytes", name, MAX_PART_BYTES)));
        }
        Ok(out)
    }

    fn has_part(&self, name: &str) -> bool {
        self.archive.file_names().any(|n| n == name)
    }

    /// Parts named `<prefix><n>.xml`, in numeric order.
    fn numbered_parts(&self, prefix: &str) -> Vec<String> {
        let mut parts: Vec<(u32, String)> = self
            .archive
            .file_names()
            .filter_map(|n| {
                let n_str = n.strip_prefix(prefix)?.strip_suffix(".xml")?;
                Some((n_str.parse().ok()?, n.to_string()))
            })
            .collect();
        parts.sort();
        parts.into_iter().map(|(_, name)| name).collect()
    }
}

fn ooxml_err(e: impl std::fmt::Display) -> ExtractError {
    ExtractError::Ooxml(e.to_string())
}

/// Text of every `<t>` element, one line per `block` element.
///
/// Word and PowerPoint both keep visible text in `t` runs grouped into `p`
/// paragraphs; only the namespace prefix differs.
fn text_runs(xml: &[u8], block: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml_err)? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => in_text = true,
            Event::Text(t) if in_text => current.push_str(&t.unescape().map_err(ooxml_err)?),
            Event::End(e) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                } else if name.as_ref() == block {
                    let line = current.trim();
                    if !line.is_empty() {
                        blocks.push(line.to_string());
                    }
                    current.clear();
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if !current.trim().is_empty() {
        blocks.push(current.trim().to_string());
    }
    Ok(blocks)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut package = OoxmlPackage::open(bytes)?;
    let xml = package.part("word/document.xml")?;
    Ok(text_runs(&xml, b"p")?.join("\n"))
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut package = OoxmlPackage::open(bytes)?;
    let mut slides = Vec::new();
    for name in package.numbered_parts("ppt/slides/slide") {
        let lines = text_runs(&package.part(&name)?, b"p")?;
        if !lines.is_empty() {
            slides.push(lines.join("\n"));
        }
    }
    Ok(slides.join("\n\n"))
}

/// One line per row, cells separated by tabs. Shared strings are resolved;
/// numbers and inline strings are kept as written.
fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut package = OoxmlPackage::open(bytes)?;
    let shared = if package.has_part("xl/sharedStrings.xml") {
        text_runs(&package.part("xl/sharedStrings.xml")?, b"si")?
    } else {
        Vec::new()
    };

    let mut sheets = Vec::new();
    for name in package
        .numbered_parts("xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let rows = sheet_rows(&package.part(&name)?, &shared)?;
        if !rows.is_empty() {
            sheets.push(rows.join("\n"));
        }
    }
    Ok(sheets.join("\n\n"))
}

fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<Vec<String>, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut shared_cell = false;
    let mut in_value = false;
    let mut cells = 0usize;
    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml_err)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e
                        .attributes()
                        .flatten()
                        .any(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s");
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Event::Text(t) if in_value => {
                let raw = t.unescape().map_err(ooxml_err)?;
                let value = raw.trim();
                let text = if shared_cell {
                    value.parse::<usize>().ok().and_then(|i| shared.get(i)).cloned()
                } else {
                    Some(value.to_string())
                };
                if let Some(text) = text.filter(|t| !t.is_empty()) {
                    row.push(text);
                    cells += 1;
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join("\t"));
                        row.clear();
                    }
                    if cells >= XLSX_MAX_CELLS_PER_SHEET {
                        break;
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join("\t"));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_extension_returns_error() {
        let err = extract("photo.png", b"foo", false).unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
        assert!(!is_supported("photo.png"));
        assert!(is_supported("Report.PDF"));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract("a.pdf", b"not a pdf", false).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract("a.docx", b"not a zip", false).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn plain_text_is_single_page() {
        let out = extract("notes.md", "Policy 204-B".as_bytes(), false).unwrap();
        assert_eq!(out.pages, vec!["Policy 204-B".to_string()]);
        let (text, starts) = out.joined();
        assert_eq!(text, "Policy 204-B");
        assert!(starts.is_empty());
    }

    #[test]
    fn page_offsets_are_in_chars() {
        let out = ExtractedText {
            pages: vec!["é1".into(), "p2".into()],
        };
        let (text, starts) = out.joined();
        assert_eq!(text, "é1\n\np2");
        assert_eq!(starts, vec![0, 4]);
    }

    #[test]
    fn html_is_stripped() {
        let html = "<html><head><style>body{}</style><script>x()</script></head>\
                    <body><h1>ESMD</h1><p>Submit &amp; track</p></body></html>";
        let text = html_to_text(html);
        assert_eq!(text, "ESMD\nSubmit & track");
    }

    fn ooxml(parts: &[(&str, &str)]) -> Vec<u8> {
        use std::io::Write;
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in parts {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn docx_keeps_paragraphs() {
        let doc = r#"<w:document xmlns:w="w"><w:body>
            <w:p><w:r><w:t>Policy </w:t></w:r><w:r><w:t>204-B</w:t></w:r></w:p>
            <w:p><w:r><w:t>Up to 3 days &amp; no more.</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let bytes = ooxml(&[("word/document.xml", doc)]);
        let out = extract("policy.docx", &bytes, false).unwrap();
        assert_eq!(out.pages, vec!["Policy 204-B\nUp to 3 days & no more.".to_string()]);
    }

    #[test]
    fn xlsx_rows_resolve_shared_strings() {
        let shared = r#"<sst><si><t>Code</t></si><si><t>Days</t></si><si><t>204-B</t></si></sst>"#;
        let sheet = r#"<worksheet><sheetData>
            <row><c t="s"><v>0</v></c><c t="s"><v>1</v></c></row>
            <row><c t="s"><v>2</v></c><c><v>3</v></c></row>
        </sheetData></worksheet>"#;
        let bytes = ooxml(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        let out = extract("limits.xlsx", &bytes, false).unwrap();
        assert_eq!(out.pages, vec!["Code\tDays\n204-B\t3".to_string()]);
    }

    #[test]
    fn pptx_slides_in_numeric_order() {
        let slide = |text: &str| format!(r#"<p:sld><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:sld>"#, text);
        let (s1, s2, s10) = (slide("one"), slide("two"), slide("ten"));
        let bytes = ooxml(&[
            ("ppt/slides/slide10.xml", s10.as_str()),
            ("ppt/slides/slide2.xml", s2.as_str()),
            ("ppt/slides/slide1.xml", s1.as_str()),
        ]);
        let out = extract("deck.pptx", &bytes, false).unwrap();
        assert_eq!(out.pages, vec!["one\n\ntwo\n\nten".to_string()]);
    }

    #[test]
    fn docx_without_document_part_fails() {
        let bytes = ooxml(&[("word/styles.xml", "<styles/>")]);
        let err = extract("empty.docx", &bytes, false).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }
}
