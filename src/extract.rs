//! Format dispatch and text extraction for uploaded documents.
//!
//! [`Extractor::extract`] turns blob bytes plus a declared MIME type into
//! plain UTF-8 text and [`ExtractedMetadata`]:
//!
//! | Format | Path |
//! |--------|------|
//! | `text/plain`, `text/markdown`, `text/csv` | decoded verbatim |
//! | `application/pdf` | OCR (force, deskew) then text layer; direct text layer if OCR is off or unavailable |
//! | `image/png`, `image/jpeg`, `image/tiff` | OCR to PDF, then text layer; requires OCR |
//! | DOCX / PPTX / XLSX | XML text runs from the ZIP container |
//!
//! Anything else is [`Error::UnsupportedFormat`]. Malformed content of a
//! supported type is a [`Error::Validation`]; neither is retried.

use std::io::Read;

use thiserror::Error;

use crate::config::ExtractionConfig;
use crate::error::Error;
use crate::models::ExtractedMetadata;
use crate::ocr::{OcrEngine, OcrOutcome};

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_CSV: &str = "text/csv";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_PNG: &str = "image/png";
pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_TIFF: &str = "image/tiff";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

impl From<ExtractError> for Error {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::UnsupportedContentType(ct) => Error::UnsupportedFormat(ct),
            other => Error::Validation(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Pdf,
    Image,
    Docx,
    Pptx,
    Xlsx,
}

impl Format {
    /// Parameters (`; charset=...`) and case are ignored.
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        match mime_essence(mime_type).as_str() {
            MIME_TEXT | MIME_MARKDOWN | MIME_CSV => Some(Format::Text),
            MIME_PDF => Some(Format::Pdf),
            MIME_PNG | MIME_JPEG | MIME_TIFF => Some(Format::Image),
            MIME_DOCX => Some(Format::Docx),
            MIME_PPTX => Some(Format::Pptx),
            MIME_XLSX => Some(Format::Xlsx),
            _ => None,
        }
    }
}

fn mime_essence(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: String,
    pub metadata: ExtractedMetadata,
}

#[derive(Debug, Clone)]
pub struct Extractor {
    ocr: Option<OcrEngine>,
    default_language: String,
}

impl Extractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            ocr: config.ocr.then(|| OcrEngine::new(config)),
            default_language: config.default_language.clone(),
        }
    }

    pub async fn extract(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
        title: &str,
    ) -> crate::error::Result<Extraction> {
        let format = Format::from_mime(mime_type)
            .ok_or_else(|| Error::UnsupportedFormat(mime_type.to_string()))?;
        let essence = mime_essence(mime_type);

        let mut core = CoreProperties::default();
        let (text, language) = match format {
            Format::Text => (decode_text(&bytes), None),
            Format::Pdf => self.pdf_text(bytes).await?,
            Format::Image => {
                let extension = essence.trim_start_matches("image/");
                self.image_text(bytes, extension).await?
            }
            Format::Docx | Format::Pptx | Format::Xlsx => {
                let (text, props) = tokio::task::spawn_blocking(move || {
                    let props = read_core_properties(&bytes);
                    extract_ooxml(&bytes, format).map(|text| (text, props))
                })
                .await
                .map_err(|e| Error::Dependency(e.into()))??;
                core = props;
                (text, None)
            }
        };

        let metadata = build_metadata(
            &text,
            title,
            core,
            language.unwrap_or_else(|| self.default_language.clone()),
        );
        Ok(Extraction { text, metadata })
    }

    /// Returns the text and, when OCR ran, the OCR language.
    async fn pdf_text(&self, bytes: Vec<u8>) -> crate::error::Result<(String, Option<String>)> {
        let Some(ref ocr) = self.ocr else {
            return Ok((pdf_text_layer(bytes).await?, None));
        };

        match ocr.run(&bytes, "pdf", false).await? {
            OcrOutcome::Pdf(ocred) => Ok((
                pdf_text_layer(ocred).await?,
                Some(ocr.language().to_string()),
            )),
            OcrOutcome::Unavailable(reason) => {
                tracing::warn!(%reason, "OCR unavailable; using embedded PDF text layer");
                Ok((pdf_text_layer(bytes).await?, None))
            }
        }
    }

    async fn image_text(
        &self,
        bytes: Vec<u8>,
        extension: &str,
    ) -> crate::error::Result<(String, Option<String>)> {
        let Some(ref ocr) = self.ocr else {
            return Err(Error::UnsupportedFormat(format!(
                "image/{} requires OCR, which is disabled",
                extension
            )));
        };
        match ocr.run(&bytes, extension, true).await? {
            OcrOutcome::Pdf(ocred) => Ok((
                pdf_text_layer(ocred).await?,
                Some(ocr.language().to_string()),
            )),
            OcrOutcome::Unavailable(reason) => Err(Error::UnsupportedFormat(format!(
                "image/{} requires OCR: {}",
                extension, reason
            ))),
        }
    }
}

fn decode_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.trim_start_matches('\u{feff}').to_string()
}

async fn pdf_text_layer(bytes: Vec<u8>) -> crate::error::Result<String> {
    tokio::task::spawn_blocking(move || extract_pdf(&bytes))
        .await
        .map_err(|e| Error::Dependency(e.into()))?
        .map_err(Error::from)
}

fn build_metadata(
    text: &str,
    fallback_title: &str,
    core: CoreProperties,
    detected_language: String,
) -> ExtractedMetadata {
    ExtractedMetadata {
        title: core
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| fallback_title.to_string()),
        author: core.creator.filter(|a| !a.trim().is_empty()),
        // Text layers separate pages with form feeds.
        page_count: text.split('\u{c}').count() as u32,
        word_count: text.split_whitespace().count(),
        language: core.language.unwrap_or(detected_language),
        created_date: core.created,
    }
}

/// Synchronous extraction of the formats that need no external tools.
#[cfg(test)]
fn extract_text(bytes: &[u8], content_type: &str) -> Result<String, ExtractError> {
    match Format::from_mime(content_type) {
        Some(Format::Text) => Ok(decode_text(bytes)),
        Some(Format::Pdf) => extract_pdf(bytes),
        Some(format @ (Format::Docx | Format::Pptx | Format::Xlsx)) => extract_ooxml(bytes, format),
        _ => Err(ExtractError::UnsupportedContentType(
            content_type.to_string(),
        )),
    }
}

fn extract_ooxml(bytes: &[u8], format: Format) -> Result<String, ExtractError> {
    match format {
        Format::Docx => extract_docx(bytes),
        Format::Pptx => extract_pptx(bytes),
        Format::Xlsx => extract_xlsx(bytes),
        other => Err(ExtractError::UnsupportedContentType(format!("{:?}", other))),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

// ============ OOXML ============

type ZipReader<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_zip(bytes: &[u8]) -> Result<ZipReader<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut ZipReader<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Concatenate the text of every `<*:t>` element; `paragraph` elements end
/// a line.
fn collect_text_runs(xml: &[u8], paragraph: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_t = false;
                } else if name.as_ref() == paragraph && !out.ends_with('\n') && !out.is_empty() {
                    out.push('\n');
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    collect_text_runs(&xml, b"p")
}

/// Entries named `{prefix}{n}.xml`, sorted by `n`.
fn numbered_entries(archive: &ZipReader<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let mut out = String::new();
    for name in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let text = collect_text_runs(&xml, b"p")?;
        if text.is_empty() {
            continue;
        }
        // One page per slide.
        if !out.is_empty() {
            out.push('\u{c}');
        }
        out.push_str(&text);
    }
    Ok(out)
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let mut out = String::new();
    for name in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let cell_texts = extract_xlsx_sheet_cells(&sheet_xml, &shared_strings)?;
        if !out.is_empty() && !cell_texts.is_empty() {
            out.push('\n');
        }
        out.push_str(&cell_texts);
    }
    Ok(out)
}

fn read_shared_strings(archive: &mut ZipReader<'_>) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    if archive.by_name("xl/sharedStrings.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(ref mut s) = current {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Shared-string and inline cell values, space separated.
fn extract_xlsx_sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut cell_is_shared_str = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                } else if e.local_name().as_ref() == b"v" {
                    in_v = true;
                }
            }
            Ok(Event::Text(te)) if in_v => {
                let v = te.unescape().unwrap_or_default();
                let s = v.trim();
                if !s.is_empty() {
                    if cell_is_shared_str {
                        if let Some(shared) = s.parse::<usize>().ok().and_then(|i| shared_strings.get(i)) {
                            cells.push(shared.clone());
                        }
                    } else {
                        cells.push(s.to_string());
                    }
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"v" {
                    in_v = false;
                } else if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = false;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

/// Dublin Core fields from `docProps/core.xml`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CoreProperties {
    pub title: Option<String>,
    pub creator: Option<String>,
    pub created: Option<String>,
    pub language: Option<String>,
}

/// Missing or unreadable properties yield the empty default.
pub fn read_core_properties(bytes: &[u8]) -> CoreProperties {
    use quick_xml::events::Event;

    let mut props = CoreProperties::default();
    let Ok(mut archive) = open_zip(bytes) else {
        return props;
    };
    let Ok(xml) = read_zip_entry_bounded(&mut archive, "docProps/core.xml", MAX_XML_ENTRY_BYTES)
    else {
        return props;
    };

    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut field: Option<Vec<u8>> = None;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => field = Some(e.local_name().as_ref().to_vec()),
            Ok(Event::Text(te)) => {
                let value = te.unescape().unwrap_or_default().trim().to_string();
                let slot = match field.as_deref() {
                    Some(b"title") => Some(&mut props.title),
                    Some(b"creator") => Some(&mut props.creator),
                    Some(b"created") => Some(&mut props.created),
                    Some(b"language") => Some(&mut props.language),
                    _ => None,
                };
                if let Some(slot) = slot.filter(|_| !value.is_empty()) {
                    *slot = Some(value);
                }
            }
            Ok(Event::End(_)) => field = None,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    props
}
