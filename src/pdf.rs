// 📑 PDF content extraction - page text plus detected tables
//
// Two strategies:
// 1. Layout-aware: walk each page's content stream, position text runs with
//    the text matrix, rebuild lines and cells, detect tables.
// 2. Plain text: lopdf's own `extract_text`, no tables.
// The second only runs when the first fails or finds nothing.

use crate::error::ExtractError;
use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Estimated glyph advance as a fraction of the font size
const GLYPH_WIDTH_RATIO: f32 = 0.5;
/// A gap wider than `x_tolerance * COLUMN_GAP_FACTOR` starts a new cell
const COLUMN_GAP_FACTOR: f32 = 4.0;
/// TJ adjustments beyond this (thousandths of an em) read as a word space
const TJ_SPACE_THRESHOLD: f32 = 200.0;

// ============================================================================
// CORE TYPES
// ============================================================================

/// Rectangular grid of cells; short rows are padded with empty strings
pub type Table = Vec<Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSettings {
    /// Horizontal gap tolerance; scaled to the column gap
    pub x_tolerance: f32,
    /// Max baseline difference for runs on the same line
    pub y_tolerance: f32,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            x_tolerance: 3.0,
            y_tolerance: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfPage {
    /// 1-based
    pub page_number: u32,
    pub text: String,
    pub tables: Vec<Table>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfContent {
    pub total_pages: usize,
    pub pages: Vec<PdfPage>,
    /// `/Info` entries (Title, Author, Producer, ...)
    pub metadata: BTreeMap<String, String>,
}

impl PdfContent {
    /// All pages joined with `--- Page N ---` headers
    pub fn full_text(&self) -> String {
        self.pages
            .iter()
            .map(|p| format!("--- Page {} ---\n{}", p.page_number, p.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn has_text(&self) -> bool {
        self.pages.iter().any(|p| !p.text.trim().is_empty())
    }
}

// ============================================================================
// ENTRY POINTS
// ============================================================================

pub fn extract(bytes: &[u8]) -> Result<PdfContent, ExtractError> {
    extract_with(bytes, &ExtractionSettings::default())
}

pub fn extract_with(bytes: &[u8], settings: &ExtractionSettings) -> Result<PdfContent, ExtractError> {
    let layout_error = match extract_layout(bytes, settings) {
        Ok(content) if content.has_text() => return Ok(content),
        Ok(_) => {
            debug!("Layout extraction found no text, trying plain text");
            None
        }
        Err(e) => {
            warn!(error = %e, "Layout extraction failed, falling back to plain text");
            Some(e)
        }
    };

    match extract_plain(bytes) {
        Ok(content) if content.has_text() => Ok(content),
        Ok(_) => Err(ExtractError::NoExtractableText),
        Err(e @ ExtractError::Unreadable(_)) if matches!(layout_error, Some(ExtractError::Unreadable(_))) => Err(e),
        Err(e) => {
            debug!(error = %e, "Plain text extraction failed");
            Err(ExtractError::NoExtractableText)
        }
    }
}

/// Layout-aware strategy
pub fn extract_layout(bytes: &[u8], settings: &ExtractionSettings) -> Result<PdfContent, ExtractError> {
    let doc = load(bytes)?;
    let page_ids = doc.get_pages();
    let mut pages = Vec::with_capacity(page_ids.len());

    for (page_number, page_id) in page_ids {
        let data = doc
            .get_page_content(page_id)
            .map_err(|e| ExtractError::Layout(format!("page {}: {}", page_number, e)))?;
        let content = Content::decode(&data)
            .map_err(|e| ExtractError::Layout(format!("page {}: {}", page_number, e)))?;

        let runs = collect_runs(&content);
        let lines = group_lines(runs, settings);

        let text = lines
            .iter()
            .map(|cells| cells.join("  "))
            .collect::<Vec<_>>()
            .join("\n");

        pages.push(PdfPage {
            page_number,
            text,
            tables: detect_tables(&lines),
        });
    }

    Ok(PdfContent {
        total_pages: pages.len(),
        pages,
        metadata: read_metadata(&doc),
    })
}

/// Plain text strategy
pub fn extract_plain(bytes: &[u8]) -> Result<PdfContent, ExtractError> {
    let doc = load(bytes)?;
    let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();

    let mut pages = Vec::with_capacity(page_numbers.len());
    for page_number in page_numbers {
        let text = doc
            .extract_text(&[page_number])
            .map_err(|e| ExtractError::Plain(format!("page {}: {}", page_number, e)))?;
        pages.push(PdfPage {
            page_number,
            text: text.trim_end().to_string(),
            tables: Vec::new(),
        });
    }

    Ok(PdfContent {
        total_pages: pages.len(),
        pages,
        metadata: read_metadata(&doc),
    })
}

fn load(bytes: &[u8]) -> Result<Document, ExtractError> {
    Document::load_mem(bytes).map_err(|e| ExtractError::Unreadable(e.to_string()))
}

// ============================================================================
// CONTENT STREAM WALK
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct TextRun {
    x: f32,
    y: f32,
    width: f32,
    text: String,
}

/// Text state tracked while walking the operators
struct TextState {
    /// [a b c d e f]
    matrix: [f32; 6],
    line_matrix: [f32; 6],
    leading: f32,
    font_size: f32,
}

impl TextState {
    const IDENTITY: [f32; 6] = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

    fn new() -> Self {
        Self {
            matrix: Self::IDENTITY,
            line_matrix: Self::IDENTITY,
            leading: 0.0,
            font_size: 12.0,
        }
    }

    fn begin(&mut self) {
        self.matrix = Self::IDENTITY;
        self.line_matrix = Self::IDENTITY;
    }

    fn set_matrix(&mut self, m: [f32; 6]) {
        self.matrix = m;
        self.line_matrix = m;
    }

    fn move_line(&mut self, tx: f32, ty: f32) {
        let [a, b, c, d, e, f] = self.line_matrix;
        self.line_matrix = [a, b, c, d, tx * a + ty * c + e, tx * b + ty * d + f];
        self.matrix = self.line_matrix;
    }

    fn next_line(&mut self) {
        self.move_line(0.0, -self.leading);
    }

    fn show(&mut self, text: String, runs: &mut Vec<TextRun>) {
        if text.trim().is_empty() {
            return;
        }
        let scale = self.matrix[0].abs().max(f32::EPSILON);
        let width = text.chars().count() as f32 * self.font_size * GLYPH_WIDTH_RATIO * scale;
        runs.push(TextRun {
            x: self.matrix[4],
            y: self.matrix[5],
            width,
            text,
        });
        self.matrix[4] += width;
    }
}

fn collect_runs(content: &Content) -> Vec<TextRun> {
    let mut state = TextState::new();
    let mut runs = Vec::new();

    for op in &content.operations {
        let operands = &op.operands;
        match op.operator.as_str() {
            "BT" => state.begin(),
            "Tf" => {
                if let Some(size) = operands.get(1).and_then(number) {
                    state.font_size = size;
                }
            }
            "TL" => {
                if let Some(leading) = operands.first().and_then(number) {
                    state.leading = leading;
                }
            }
            "Tm" => {
                let values: Vec<f32> = operands.iter().filter_map(number).collect();
                if let Ok(m) = <[f32; 6]>::try_from(values.as_slice()) {
                    state.set_matrix(m);
                }
            }
            "Td" | "TD" => {
                if let (Some(tx), Some(ty)) = (
                    operands.first().and_then(number),
                    operands.get(1).and_then(number),
                ) {
                    if op.operator == "TD" {
                        state.leading = -ty;
                    }
                    state.move_line(tx, ty);
                }
            }
            "T*" => state.next_line(),
            "Tj" => {
                if let Some(text) = operands.first().and_then(string_operand) {
                    state.show(text, &mut runs);
                }
            }
            "'" => {
                state.next_line();
                if let Some(text) = operands.first().and_then(string_operand) {
                    state.show(text, &mut runs);
                }
            }
            "\"" => {
                state.next_line();
                if let Some(text) = operands.get(2).and_then(string_operand) {
                    state.show(text, &mut runs);
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = operands.first() {
                    state.show(join_tj_array(items), &mut runs);
                }
            }
            _ => {}
        }
    }

    runs
}

fn join_tj_array(items: &[Object]) -> String {
    let mut text = String::new();
    for item in items {
        match item {
            Object::String(bytes, _) => text.push_str(&decode_pdf_string(bytes)),
            other => {
                if let Some(adjust) = number(other) {
                    if -adjust > TJ_SPACE_THRESHOLD && !text.ends_with(' ') {
                        text.push(' ');
                    }
                }
            }
        }
    }
    text
}

fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(f) => Some(*f),
        _ => None,
    }
}

fn string_operand(obj: &Object) -> Option<String> {
    match obj {
        Object::String(bytes, _) => Some(decode_pdf_string(bytes)),
        _ => None,
    }
}

/// UTF-16BE when BOM-prefixed, otherwise single-byte (Latin-1 superset of WinAnsi text)
fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| b as char).collect()
}

// ============================================================================
// LAYOUT RECONSTRUCTION
// ============================================================================

/// Group runs into lines (top of page first) and split each line into cells
fn group_lines(mut runs: Vec<TextRun>, settings: &ExtractionSettings) -> Vec<Vec<String>> {
    runs.sort_by(|a, b| b.y.total_cmp(&a.y).then(a.x.total_cmp(&b.x)));

    let mut lines: Vec<(f32, Vec<TextRun>)> = Vec::new();
    for run in runs {
        match lines.last_mut() {
            Some((baseline, members)) if (*baseline - run.y).abs() <= settings.y_tolerance => {
                members.push(run);
            }
            _ => lines.push((run.y, vec![run])),
        }
    }

    let column_gap = settings.x_tolerance * COLUMN_GAP_FACTOR;

    lines
        .into_iter()
        .map(|(_, mut members)| {
            members.sort_by(|a, b| a.x.total_cmp(&b.x));

            let mut cells: Vec<String> = Vec::new();
            let mut right_edge: Option<f32> = None;
            for run in members {
                let text = run.text.trim();
                match (right_edge, cells.last_mut()) {
                    (Some(edge), Some(cell)) if run.x - edge <= column_gap => {
                        cell.push(' ');
                        cell.push_str(text);
                    }
                    _ => cells.push(text.to_string()),
                }
                right_edge = Some(run.x + run.width);
            }
            cells
        })
        .filter(|cells| !cells.is_empty())
        .collect()
}

/// Runs of at least two consecutive multi-cell lines become a table
fn detect_tables(lines: &[Vec<String>]) -> Vec<Table> {
    let mut tables = Vec::new();
    let mut current: Vec<&Vec<String>> = Vec::new();

    for line in lines {
        if line.len() >= 2 {
            current.push(line);
            continue;
        }
        if let Some(table) = finish_table(&mut current) {
            tables.push(table);
        }
    }
    if let Some(table) = finish_table(&mut current) {
        tables.push(table);
    }

    tables
}

fn finish_table(rows: &mut Vec<&Vec<String>>) -> Option<Table> {
    let taken = std::mem::take(rows);
    if taken.len() < 2 {
        return None;
    }

    let width = taken.iter().map(|r| r.len()).max().unwrap_or(0);
    Some(
        taken
            .into_iter()
            .map(|row| {
                let mut row = row.clone();
                row.resize(width, String::new());
                row
            })
            .collect(),
    )
}

// ============================================================================
// METADATA
// ============================================================================

fn read_metadata(doc: &Document) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();

    let info: Option<&Dictionary> = match doc.trailer.get(b"Info") {
        Ok(Object::Reference(id)) => doc.get_object(*id).ok().and_then(|o| o.as_dict().ok()),
        Ok(Object::Dictionary(dict)) => Some(dict),
        _ => None,
    };

    if let Some(info) = info {
        for (key, value) in info.iter() {
            if let Object::String(bytes, _) = value {
                metadata.insert(
                    String::from_utf8_lossy(key).into_owned(),
                    decode_pdf_string(bytes),
                );
            }
        }
    }

    metadata
}

// ============================================================================
// TESTS
// ============================================================================
