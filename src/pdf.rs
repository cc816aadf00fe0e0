// src/pdf.rs

use crate::error::DecodeError;
use crate::layout::{Page, Token};
use lopdf::content::Content;
use lopdf::{Document, Encoding, Object, ObjectId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Anything that can hand out decoded pages of one document.
pub trait PageSource: Send + Sync {
    fn page_count(&self) -> usize;

    /// Decode a single page into positioned tokens. May block for a long
    /// time on malformed content streams.
    fn page(&self, index: usize) -> Result<Page, DecodeError>;

    /// True when the document looks like a scan with no text layer.
    fn looks_like_scanned(&self) -> bool {
        false
    }
}

/// Opens a file on disk as a [`PageSource`].
pub trait OpenDocument: Send + Sync {
    fn open(&self, path: &Path) -> Result<Arc<dyn PageSource>, DecodeError>;
}

pub struct LopdfOpener;

impl OpenDocument for LopdfOpener {
    fn open(&self, path: &Path) -> Result<Arc<dyn PageSource>, DecodeError> {
        Ok(Arc::new(LopdfDocument::load(path)?))
    }
}

pub struct LopdfDocument {
    doc: Document,
    pages: Vec<ObjectId>,
}

impl LopdfDocument {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        Self::load_mem(&std::fs::read(path)?)
    }

    pub fn load_mem(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self::from_document(Document::load_mem(bytes)?))
    }

    fn from_document(doc: Document) -> Self {
        let pages = doc.get_pages().into_values().collect();
        Self { doc, pages }
    }
}

impl PageSource for LopdfDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page(&self, index: usize) -> Result<Page, DecodeError> {
        let page_id = *self.pages.get(index).ok_or(DecodeError::PageOutOfRange {
            index,
            count: self.pages.len(),
        })?;
        decode_page(&self.doc, page_id)
    }

    fn looks_like_scanned(&self) -> bool {
        looks_like_scanned(&self.doc)
    }
}

// ---------------------------------------------------------------------------
// Content stream walk
// ---------------------------------------------------------------------------

type Matrix = [f64; 6];

const IDENTITY: Matrix = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

/// Letter size, used when no MediaBox can be found.
const DEFAULT_MEDIA_BOX: [f64; 4] = [0.0, 0.0, 612.0, 792.0];

/// Glyph advance as a fraction of the font size; real widths are not read.
const APPROX_CHAR_WIDTH_RATIO: f64 = 0.5;

/// Fragments closer than this (times the font size) are one word.
const WORD_JOIN_GAP_RATIO: f64 = 0.15;

/// Concatenate `a` then `b` (row-vector convention used by PDF).
fn multiply(a: &Matrix, b: &Matrix) -> Matrix {
    [
        a[0] * b[0] + a[1] * b[2],
        a[0] * b[1] + a[1] * b[3],
        a[2] * b[0] + a[3] * b[2],
        a[2] * b[1] + a[3] * b[3],
        a[4] * b[0] + a[5] * b[2] + b[4],
        a[4] * b[1] + a[5] * b[3] + b[5],
    ]
}

fn translation(tx: f64, ty: f64) -> Matrix {
    [1.0, 0.0, 0.0, 1.0, tx, ty]
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(f64::from(*r)),
        _ => None,
    }
}

fn numbers<const N: usize>(operands: &[Object]) -> Option<[f64; N]> {
    if operands.len() < N {
        return None;
    }
    let mut out = [0.0; N];
    for (slot, obj) in out.iter_mut().zip(operands) {
        *slot = number(obj)?;
    }
    Some(out)
}

/// Fallback for strings drawn with a font whose encoding is unknown:
/// UTF-16BE when BOM-prefixed, Latin-1 otherwise.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|&b| b as char).collect()
    }
}

/// Text encodings of the fonts a page can select with `Tf`, keyed by
/// resource name.
struct PageFonts<'a> {
    encodings: BTreeMap<Vec<u8>, Encoding<'a>>,
}

impl<'a> PageFonts<'a> {
    fn load(doc: &'a Document, page_id: ObjectId) -> Self {
        let mut encodings = BTreeMap::new();
        for (name, font) in doc.get_page_fonts(page_id).unwrap_or_default() {
            if !font.type_is(b"Font") {
                continue;
            }
            match font.get_font_encoding(doc) {
                Ok(encoding) => {
                    encodings.insert(name, encoding);
                }
                Err(e) => debug!(font = %String::from_utf8_lossy(&name), error = %e, "No usable font encoding"),
            }
        }
        Self { encodings }
    }

    /// Decode a shown string through the font's encoding (WinAnsi, MacRoman,
    /// ToUnicode CMap, ...), falling back to [`decode_pdf_string`].
    fn decode(&self, font: Option<&[u8]>, bytes: &[u8]) -> String {
        font.and_then(|name| self.encodings.get(name))
            .and_then(|encoding| Document::decode_text(encoding, bytes).ok())
            .unwrap_or_else(|| decode_pdf_string(bytes))
    }
}

struct OpenWord {
    text: String,
    x0: f64,
    top: f64,
    end_x: f64,
    size: f64,
}

/// Collects glyphs into whitespace-delimited words in page space.
struct WordSink {
    origin: (f64, f64),
    height: f64,
    tokens: Vec<Token>,
    open: Option<OpenWord>,
}

impl WordSink {
    fn new(media_box: [f64; 4]) -> Self {
        Self {
            origin: (media_box[0], media_box[1]),
            height: media_box[3] - media_box[1],
            tokens: Vec::new(),
            open: None,
        }
    }

    fn flush(&mut self) {
        if let Some(word) = self.open.take() {
            self.tokens.push(Token::new(word.text, word.x0, word.top));
        }
    }

    /// Record a glyph drawn at device position (`x`, `y`) ending at `end_x`.
    fn glyph(&mut self, ch: char, x: f64, y: f64, end_x: f64, size: f64) {
        if ch.is_whitespace() {
            self.flush();
            return;
        }
        let x = x - self.origin.0;
        let end_x = end_x - self.origin.0;
        let top = self.height - (y - self.origin.1 + size);

        if let Some(word) = self.open.as_mut() {
            let same_row = (word.top - top).abs() < 0.5;
            let touching = (x - word.end_x).abs() < WORD_JOIN_GAP_RATIO * word.size.max(size);
            if same_row && touching {
                word.text.push(ch);
                word.end_x = end_x;
                return;
            }
        }
        self.flush();
        self.open = Some(OpenWord {
            text: ch.to_string(),
            x0: x,
            top,
            end_x,
            size,
        });
    }

    fn finish(mut self) -> Vec<Token> {
        self.flush();
        self.tokens
    }
}

struct TextState {
    ctm: Matrix,
    saved: Vec<Matrix>,
    tm: Matrix,
    tlm: Matrix,
    font: Option<Vec<u8>>,
    font_size: f64,
    leading: f64,
    char_spacing: f64,
    word_spacing: f64,
    horiz_scale: f64,
    rise: f64,
}

impl Default for TextState {
    fn default() -> Self {
        Self {
            ctm: IDENTITY,
            saved: Vec::new(),
            tm: IDENTITY,
            tlm: IDENTITY,
            font: None,
            font_size: 0.0,
            leading: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            horiz_scale: 1.0,
            rise: 0.0,
        }
    }
}

impl TextState {
    fn move_line(&mut self, tx: f64, ty: f64) {
        self.tlm = multiply(&translation(tx, ty), &self.tlm);
        self.tm = self.tlm;
    }

    fn advance(&mut self, tx: f64) {
        self.tm = multiply(&translation(tx, 0.0), &self.tm);
    }

    /// Device-space point of the current glyph origin and the rendered font size.
    fn device_origin(&self) -> (f64, f64, f64) {
        let m = multiply(&self.tm, &self.ctm);
        let x = self.rise * m[2] + m[4];
        let y = self.rise * m[3] + m[5];
        let scale = (m[2] * m[2] + m[3] * m[3]).sqrt();
        (x, y, self.font_size * scale)
    }

    fn show(&mut self, bytes: &[u8], fonts: &PageFonts, sink: &mut WordSink) {
        let text = fonts.decode(self.font.as_deref(), bytes);
        for ch in text.chars() {
            let (x, y, size) = self.device_origin();
            let mut tx = self.font_size * APPROX_CHAR_WIDTH_RATIO + self.char_spacing;
            if ch == ' ' {
                tx += self.word_spacing;
            }
            self.advance(tx * self.horiz_scale);
            let (end_x, _, _) = self.device_origin();
            sink.glyph(ch, x, y, end_x, size);
        }
    }

    fn show_array(&mut self, items: &[Object], fonts: &PageFonts, sink: &mut WordSink) {
        for item in items {
            match item {
                Object::String(bytes, _) => self.show(bytes, fonts, sink),
                other => {
                    if let Some(adjust) = number(other) {
                        self.advance(-adjust / 1000.0 * self.font_size * self.horiz_scale);
                    }
                }
            }
        }
    }
}

fn media_box(doc: &Document, page_id: ObjectId) -> Option<[f64; 4]> {
    let mut id = page_id;
    // MediaBox is inheritable through the page tree
    for _ in 0..32 {
        let dict = doc.get_object(id).ok()?.as_dict().ok()?;
        if let Ok(obj) = dict.get(b"MediaBox") {
            let (_, resolved) = doc.dereference(obj).ok()?;
            let values = numbers::<4>(resolved.as_array().ok()?)?;
            return Some(values);
        }
        id = dict.get(b"Parent").ok()?.as_reference().ok()?;
    }
    None
}

/// Walk one page's content stream and produce word tokens.
pub fn decode_page(doc: &Document, page_id: ObjectId) -> Result<Page, DecodeError> {
    let media_box = media_box(doc, page_id).unwrap_or(DEFAULT_MEDIA_BOX);
    let content = Content::decode(&doc.get_page_content(page_id)?)?;
    let fonts = PageFonts::load(doc, page_id);

    let mut state = TextState::default();
    let mut sink = WordSink::new(media_box);

    for op in &content.operations {
        let operands = op.operands.as_slice();
        match op.operator.as_str() {
            "q" => state.saved.push(state.ctm),
            "Q" => {
                if let Some(ctm) = state.saved.pop() {
                    state.ctm = ctm;
                }
            }
            "cm" => {
                if let Some(m) = numbers::<6>(operands) {
                    state.ctm = multiply(&m, &state.ctm);
                }
            }
            "BT" => {
                state.tm = IDENTITY;
                state.tlm = IDENTITY;
            }
            "Tf" => {
                state.font = operands.first().and_then(|o| o.as_name().ok()).map(<[u8]>::to_vec);
                if let Some(size) = operands.get(1).and_then(number) {
                    state.font_size = size;
                }
            }
            "Tm" => {
                if let Some(m) = numbers::<6>(operands) {
                    state.tm = m;
                    state.tlm = m;
                }
            }
            "Td" => {
                if let Some([tx, ty]) = numbers::<2>(operands) {
                    state.move_line(tx, ty);
                }
            }
            "TD" => {
                if let Some([tx, ty]) = numbers::<2>(operands) {
                    state.leading = -ty;
                    state.move_line(tx, ty);
                }
            }
            "T*" => state.move_line(0.0, -state.leading),
            "TL" => {
                if let Some(v) = operands.first().and_then(number) {
                    state.leading = v;
                }
            }
            "Tc" => {
                if let Some(v) = operands.first().and_then(number) {
                    state.char_spacing = v;
                }
            }
            "Tw" => {
                if let Some(v) = operands.first().and_then(number) {
                    state.word_spacing = v;
                }
            }
            "Tz" => {
                if let Some(v) = operands.first().and_then(number) {
                    state.horiz_scale = v / 100.0;
                }
            }
            "Ts" => {
                if let Some(v) = operands.first().and_then(number) {
                    state.rise = v;
                }
            }
            "Tj" => {
                if let Some(Object::String(bytes, _)) = operands.first() {
                    state.show(bytes, &fonts, &mut sink);
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = operands.first() {
                    state.show_array(items, &fonts, &mut sink);
                }
            }
            "'" => {
                state.move_line(0.0, -state.leading);
                if let Some(Object::String(bytes, _)) = operands.first() {
                    state.show(bytes, &fonts, &mut sink);
                }
            }
            "\"" => {
                if let Some([aw, ac]) = numbers::<2>(operands) {
                    state.word_spacing = aw;
                    state.char_spacing = ac;
                }
                state.move_line(0.0, -state.leading);
                if let Some(Object::String(bytes, _)) = operands.get(2) {
                    state.show(bytes, &fonts, &mut sink);
                }
            }
            _ => {}
        }
    }

    Ok(Page {
        tokens: sink.finish(),
        width: media_box[2] - media_box[0],
        height: media_box[3] - media_box[1],
    })
}

/// Heuristic: inspect the PDF object tree for signs that every page
/// is just a single image with no text operators.
///
/// A page with XObject images but **no** Font resources is almost
/// certainly a scanned page.
fn looks_like_scanned(doc: &Document) -> bool {
    let pages = doc.get_pages();
    if pages.is_empty() {
        return false;
    }

    let image_only_pages = pages
        .values()
        .filter_map(|id| doc.get_object(*id).ok())
        .filter_map(|obj| obj.as_dict().ok())
        .filter(|dict| has_resource(doc, dict, b"XObject") && !has_resource(doc, dict, b"Font"))
        .count();

    let ratio = image_only_pages as f64 / pages.len() as f64;
    info!(
        total_pages = pages.len(),
        image_only = image_only_pages,
        ratio = format!("{ratio:.2}"),
        "Scanned-page analysis"
    );

    ratio >= 0.8
}

fn has_resource(doc: &Document, page_dict: &lopdf::Dictionary, key: &[u8]) -> bool {
    page_dict
        .get(b"Resources")
        .ok()
        .and_then(|r| doc.dereference(r).ok())
        .and_then(|(_, resolved)| resolved.as_dict().ok())
        .and_then(|res| res.get(key).ok())
        .and_then(|f| doc.dereference(f).ok())
        .and_then(|(_, resolved)| resolved.as_dict().ok())
        .is_some_and(|entries| !entries.is_empty())
}

/// Plain text of a whole file through `pdf-extract`, for diagnostics.
pub fn plain_text(path: impl AsRef<Path>) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let bytes = std::fs::read(path)?;
    pdf_extract::extract_text_from_mem(&bytes).map_err(|e| format!("pdf-extract failed: {e}").into())
}

// ---------------------------------------------------------------------------
// Timed page access
// ---------------------------------------------------------------------------

/// Per-document page access with a deadline around every decode.
///
/// Decoded pages are memoized. A page that timed out or failed once is
/// never decoded again. Each decode runs on its own detached thread, so an
/// abandoned page neither holds up the runtime's shutdown nor the process exit.
pub struct PageLoader {
    source: Arc<dyn PageSource>,
    budget: Duration,
    decoded: Mutex<HashMap<usize, Arc<Page>>>,
    failed: Mutex<HashSet<usize>>,
}

impl PageLoader {
    pub fn new(source: Arc<dyn PageSource>, budget: Duration) -> Self {
        Self {
            source,
            budget,
            decoded: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashSet::new()),
        }
    }

    pub fn page_count(&self) -> usize {
        self.source.page_count()
    }

    pub fn looks_like_scanned(&self) -> bool {
        self.source.looks_like_scanned()
    }

    pub async fn load(&self, index: usize) -> Result<Arc<Page>, DecodeError> {
        let count = self.page_count();
        if index >= count {
            return Err(DecodeError::PageOutOfRange { index, count });
        }
        if self.is_failed(index) {
            return Err(DecodeError::Worker(format!("page {index} previously failed")));
        }
        if let Some(page) = self.cached(index) {
            return Ok(page);
        }

        let result = match self.spawn_decode(index) {
            Ok(rx) => match tokio::time::timeout(self.budget, rx).await {
                Err(_) => Err(DecodeError::Timeout(index)),
                Ok(Err(_)) => Err(DecodeError::Worker(format!("page {index} worker exited without a result"))),
                Ok(Ok(decoded)) => decoded,
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(page) => {
                let page = Arc::new(page);
                if let Ok(mut decoded) = self.decoded.lock() {
                    decoded.insert(index, Arc::clone(&page));
                }
                Ok(page)
            }
            Err(e) => {
                warn!(page = index, error = %e, "Skipping page");
                if let Ok(mut failed) = self.failed.lock() {
                    failed.insert(index);
                }
                Err(e)
            }
        }
    }

    fn spawn_decode(&self, index: usize) -> Result<oneshot::Receiver<Result<Page, DecodeError>>, DecodeError> {
        let (tx, rx) = oneshot::channel();
        let source = Arc::clone(&self.source);
        std::thread::Builder::new()
            .name(format!("page-{index}"))
            .spawn(move || {
                // the receiver is gone once the page timed out
                let _ = tx.send(source.page(index));
            })
            .map_err(|e| DecodeError::Worker(e.to_string()))?;
        Ok(rx)
    }

    fn is_failed(&self, index: usize) -> bool {
        self.failed.lock().is_ok_and(|failed| failed.contains(&index))
    }

    fn cached(&self, index: usize) -> Option<Arc<Page>> {
        self.decoded.lock().ok()?.get(&index).cloned()
    }
}
