//! Structure-aware text chunker.
//!
//! Splits file text into [`Chunk`]s according to a [`ChunkingStrategy`]:
//!
//! - **Structural** (default): segments at markdown headings, keeps fenced
//!   code blocks and tables atomic (never split, even when oversized), and
//!   packs paragraphs and lists into windows of `max_tokens` with a
//!   fractional overlap carried from the tail of one chunk into the head of
//!   the next. Trailing fragments under `min_tokens` merge into the previous
//!   chunk of the same section.
//! - **Paragraph**: splits on blank lines only, packing paragraphs up to
//!   `max_tokens`, no overlap.
//!
//! Chunking is a pure function of `(text, file, strategy)`. Chunk ids are
//! UUIDv5 digests of `(collection, path, index, sha256(text))`, so re-running
//! the chunker on unchanged input reproduces the exact id sequence.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, ChunkType};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x8f0e_4c1a_5b7d_4e2f_9a63_1d0c_7b52_e4a9);

/// Chunking strategy, resolved once per sync pass from configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkingStrategy {
    Structural {
        max_tokens: usize,
        overlap_fraction: f64,
        min_tokens: usize,
    },
    Paragraph {
        max_tokens: usize,
    },
}

impl ChunkingStrategy {
    /// Stable description of every parameter that influences chunk output.
    ///
    /// Stored with the sync status; a change invalidates all mappings.
    pub fn fingerprint(&self) -> String {
        match self {
            ChunkingStrategy::Structural {
                max_tokens,
                overlap_fraction,
                min_tokens,
            } => format!(
                "structural:v1:max={}:overlap={:.3}:min={}",
                max_tokens, overlap_fraction, min_tokens
            ),
            ChunkingStrategy::Paragraph { max_tokens } => {
                format!("paragraph:v1:max={}", max_tokens)
            }
        }
    }
}

/// Identifies the file being chunked.
#[derive(Debug, Clone, Copy)]
pub struct FileRef<'a> {
    pub collection_name: &'a str,
    pub file_path: &'a str,
}

/// Hex SHA-256 of a string.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic chunk id.
pub fn chunk_id(collection_name: &str, file_path: &str, chunk_index: i64, content_hash: &str) -> String {
    let key = format!(
        "{}\0{}\0{}\0{}",
        collection_name, file_path, chunk_index, content_hash
    );
    Uuid::new_v5(&CHUNK_NAMESPACE, key.as_bytes()).to_string()
}

/// Split `text` into chunks. Returns an empty vector for blank input.
pub fn chunk(text: &str, file: FileRef<'_>, strategy: &ChunkingStrategy) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut drafts = match strategy {
        ChunkingStrategy::Structural {
            max_tokens,
            overlap_fraction,
            min_tokens,
        } => {
            let max_chars = (*max_tokens * CHARS_PER_TOKEN).max(1);
            let overlap_chars = (max_chars as f64 * overlap_fraction) as usize;
            structural_drafts(text, max_chars, overlap_chars, *min_tokens * CHARS_PER_TOKEN)
        }
        ChunkingStrategy::Paragraph { max_tokens } => {
            paragraph_drafts(text, (*max_tokens * CHARS_PER_TOKEN).max(1))
        }
    };

    // A document made only of headings still yields one chunk
    if drafts.is_empty() {
        drafts.push(Draft {
            text: text.trim().to_string(),
            chunk_type: ChunkType::Text,
            header_path: Vec::new(),
            line_start: 1,
            line_end: text.lines().count().max(1),
            overlaps_prev: false,
        });
    }

    finalize(drafts, file)
}

#[derive(Debug, Clone)]
struct Draft {
    text: String,
    chunk_type: ChunkType,
    header_path: Vec<String>,
    line_start: usize,
    line_end: usize,
    overlaps_prev: bool,
}

fn finalize(drafts: Vec<Draft>, file: FileRef<'_>) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = drafts
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let content_hash = hash_text(&d.text);
            Chunk {
                id: chunk_id(file.collection_name, file.file_path, i as i64, &content_hash),
                collection_name: file.collection_name.to_string(),
                file_path: file.file_path.to_string(),
                chunk_index: i as i64,
                text: d.text.clone(),
                content_hash,
                chunk_type: d.chunk_type,
                header_path: d.header_path.clone(),
                line_start: d.line_start,
                line_end: d.line_end,
                overlap_source: Vec::new(),
            }
        })
        .collect();

    for i in 1..chunks.len() {
        if drafts[i].overlaps_prev {
            let prev_id = chunks[i - 1].id.clone();
            let cur_id = chunks[i].id.clone();
            chunks[i].overlap_source.push(prev_id);
            chunks[i - 1].overlap_source.push(cur_id);
        }
    }

    chunks
}

// ============ Block parsing ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Heading(usize),
    Paragraph,
    List,
    Code,
    Table,
}

#[derive(Debug, Clone)]
struct Block {
    kind: BlockKind,
    text: String,
    title: Option<String>,
    line_start: usize,
    line_end: usize,
}

impl Block {
    fn from_lines(kind: BlockKind, lines: &[&str], first_index: usize) -> Self {
        Block {
            kind,
            text: lines.join("\n").trim_end().to_string(),
            title: None,
            line_start: first_index + 1,
            line_end: first_index + lines.len(),
        }
    }
}

fn fence_marker(line: &str) -> Option<&'static str> {
    if line.starts_with("```") {
        Some("```")
    } else if line.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

fn heading(line: &str) -> Option<(usize, String)> {
    let level = line.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.is_empty() && !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim().to_string();
    Some((level, title))
}

fn is_table_row(line: &str) -> bool {
    line.starts_with('|')
}

fn is_list_item(line: &str) -> bool {
    if line.starts_with("- ") || line.starts_with("* ") || line.starts_with("+ ") {
        return true;
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 || digits > 9 {
        return false;
    }
    let rest = &line[digits..];
    rest.starts_with(". ") || rest.starts_with(") ")
}

fn starts_block(line: &str) -> bool {
    fence_marker(line).is_some() || heading(line).is_some() || is_table_row(line) || is_list_item(line)
}

fn parse_blocks(text: &str) -> Vec<Block> {
    let lines: Vec<&str> = text.lines().collect();
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let trimmed = lines[i].trim_start();
        if trimmed.is_empty() {
            i += 1;
            continue;
        }

        if let Some(fence) = fence_marker(trimmed) {
            let start = i;
            i += 1;
            while i < lines.len() {
                let closing = lines[i].trim_start().starts_with(fence);
                i += 1;
                if closing {
                    break;
                }
            }
            blocks.push(Block::from_lines(BlockKind::Code, &lines[start..i], start));
            continue;
        }

        if let Some((level, title)) = heading(trimmed) {
            blocks.push(Block {
                kind: BlockKind::Heading(level),
                text: trimmed.trim_end().to_string(),
                title: Some(title),
                line_start: i + 1,
                line_end: i + 1,
            });
            i += 1;
            continue;
        }

        if is_table_row(trimmed) {
            let start = i;
            while i < lines.len() && is_table_row(lines[i].trim_start()) {
                i += 1;
            }
            blocks.push(Block::from_lines(BlockKind::Table, &lines[start..i], start));
            continue;
        }

        if is_list_item(trimmed) {
            let start = i;
            i += 1;
            while i < lines.len() {
                let line = lines[i];
                let t = line.trim_start();
                if t.is_empty() {
                    break;
                }
                let continuation = line.starts_with(char::is_whitespace) && !starts_block(t);
                if is_list_item(t) || continuation {
                    i += 1;
                } else {
                    break;
                }
            }
            blocks.push(Block::from_lines(BlockKind::List, &lines[start..i], start));
            continue;
        }

        let start = i;
        i += 1;
        while i < lines.len() {
            let t = lines[i].trim_start();
            if t.is_empty() || starts_block(t) {
                break;
            }
            i += 1;
        }
        blocks.push(Block::from_lines(BlockKind::Paragraph, &lines[start..i], start));
    }

    blocks
}

// ============ Structural strategy ============

fn structural_drafts(
    text: &str,
    max_chars: usize,
    overlap_chars: usize,
    min_chars: usize,
) -> Vec<Draft> {
    let mut packer = StructuralPacker::new(max_chars, overlap_chars, min_chars);
    let mut headings: Vec<(usize, String)> = Vec::new();

    for block in parse_blocks(text) {
        match block.kind {
            BlockKind::Heading(level) => {
                headings.retain(|(l, _)| *l < level);
                headings.push((level, block.title.clone().unwrap_or_default()));
                packer.start_section(headings.iter().map(|(_, t)| t.clone()).collect());
                packer.push_packable(&block);
            }
            BlockKind::Paragraph | BlockKind::List => packer.push_packable(&block),
            BlockKind::Code => packer.push_atomic(&block, ChunkType::Code),
            BlockKind::Table => packer.push_atomic(&block, ChunkType::Table),
        }
    }

    packer.finish()
}

/// Window being filled with packable units.
#[derive(Debug)]
struct Window {
    text: String,
    /// Bytes at the start of `text` carried over from the previous chunk.
    seed_len: usize,
    all_list: bool,
    only_heading: bool,
    line_start: usize,
    line_end: usize,
    overlaps_prev: bool,
    last_unit_line: usize,
}

impl Window {
    fn empty(line_start: usize) -> Self {
        Window {
            text: String::new(),
            seed_len: 0,
            all_list: true,
            only_heading: true,
            line_start,
            line_end: line_start,
            overlaps_prev: false,
            last_unit_line: line_start,
        }
    }

    fn has_fresh(&self) -> bool {
        self.text.len() > self.seed_len
    }

    fn fresh_text(&self) -> &str {
        self.text[self.seed_len..].trim_start()
    }

    fn chunk_type(&self) -> ChunkType {
        if self.all_list {
            ChunkType::List
        } else {
            ChunkType::Text
        }
    }
}

struct StructuralPacker {
    max_chars: usize,
    overlap_chars: usize,
    min_chars: usize,
    header_path: Vec<String>,
    section_start: usize,
    window: Option<Window>,
    out: Vec<Draft>,
}

impl StructuralPacker {
    fn new(max_chars: usize, overlap_chars: usize, min_chars: usize) -> Self {
        Self {
            max_chars,
            overlap_chars,
            min_chars,
            header_path: Vec::new(),
            section_start: 0,
            window: None,
            out: Vec::new(),
        }
    }

    fn start_section(&mut self, header_path: Vec<String>) {
        self.finish_section();
        self.header_path = header_path;
        self.section_start = self.out.len();
    }

    fn push_packable(&mut self, block: &Block) {
        // Leave room for the overlap seed in front of every piece
        let piece_max = self
            .max_chars
            .saturating_sub(self.overlap_chars + 2)
            .max(1);
        for piece in hard_split(&block.text, piece_max) {
            let (ls, le) = piece_lines(&block.text, piece, block.line_start);
            self.append_piece(piece, block.kind, ls, le);
        }
    }

    fn append_piece(&mut self, piece: &str, kind: BlockKind, line_start: usize, line_end: usize) {
        let overflow = self
            .window
            .as_ref()
            .map(|w| w.has_fresh() && w.text.len() + 2 + piece.len() > self.max_chars)
            .unwrap_or(false);
        if overflow {
            self.flush(Some(piece.len()));
        }

        let w = self.window.get_or_insert_with(|| Window::empty(line_start));
        if !w.has_fresh() && w.seed_len == 0 {
            w.line_start = line_start;
        }
        if !w.text.is_empty() {
            w.text.push_str("\n\n");
        }
        w.text.push_str(piece);
        if kind != BlockKind::List {
            w.all_list = false;
        }
        if !matches!(kind, BlockKind::Heading(_)) {
            w.only_heading = false;
        }
        w.line_end = line_end;
        w.last_unit_line = line_start;
    }

    fn push_atomic(&mut self, block: &Block, chunk_type: ChunkType) {
        let mut text = block.text.clone();
        let mut line_start = block.line_start;

        // A bare heading sticks to the atomic unit that follows it
        match self.window.take() {
            Some(w) if w.only_heading && w.seed_len == 0 && w.has_fresh() => {
                text = format!("{}\n\n{}", w.text, text);
                line_start = w.line_start;
            }
            Some(w) => {
                self.window = Some(w);
                self.flush(None);
            }
            None => {}
        }

        self.out.push(Draft {
            text,
            chunk_type,
            header_path: self.header_path.clone(),
            line_start,
            line_end: block.line_end,
            overlaps_prev: false,
        });
    }

    /// Emit the current window. With `Some(next_len)`, seed a new window with
    /// the overlap tail, sized so the next piece still fits.
    fn flush(&mut self, next_len: Option<usize>) {
        let Some(w) = self.window.take() else {
            return;
        };
        if !w.has_fresh() || w.only_heading {
            return;
        }

        let draft = Draft {
            text: w.text.clone(),
            chunk_type: w.chunk_type(),
            header_path: self.header_path.clone(),
            line_start: w.line_start,
            line_end: w.line_end,
            overlaps_prev: w.overlaps_prev,
        };
        self.out.push(draft);

        if let Some(next_len) = next_len {
            let budget = self
                .overlap_chars
                .min(self.max_chars.saturating_sub(next_len + 2));
            let tail = overlap_tail(&w.text, budget);
            if !tail.is_empty() {
                let mut seeded = Window::empty(w.last_unit_line);
                seeded.text = tail.to_string();
                seeded.seed_len = seeded.text.len();
                seeded.overlaps_prev = true;
                self.window = Some(seeded);
            }
        }
    }

    fn finish_section(&mut self) {
        let Some(w) = self.window.take() else {
            return;
        };
        if !w.has_fresh() || w.only_heading {
            return;
        }

        let fresh = w.fresh_text();
        let mergeable = self.out.len() > self.section_start
            && self
                .out
                .last()
                .map(|d| matches!(d.chunk_type, ChunkType::Text | ChunkType::List))
                .unwrap_or(false);

        if fresh.len() < self.min_chars && mergeable {
            if let Some(prev) = self.out.last_mut() {
                prev.text.push_str("\n\n");
                prev.text.push_str(fresh);
                prev.line_end = w.line_end;
                if prev.chunk_type == ChunkType::List && !w.all_list {
                    prev.chunk_type = ChunkType::Text;
                }
            }
            return;
        }

        self.window = Some(w);
        self.flush(None);
    }

    fn finish(mut self) -> Vec<Draft> {
        self.finish_section();
        self.out
    }
}

/// Tail of `text` at most `budget` bytes long, starting on a word boundary.
fn overlap_tail(text: &str, budget: usize) -> &str {
    if budget == 0 {
        return "";
    }
    if text.len() <= budget {
        return text;
    }
    let mut start = text.len() - budget;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    let tail = &text[start..];
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim_start(),
        None => tail,
    }
}

/// Split text into pieces of at most `max_chars`, preferring line then word
/// boundaries.
fn hard_split(text: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut remaining = text.trim();

    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            pieces.push(remaining);
            break;
        }

        let mut split_at = max_chars;
        while !remaining.is_char_boundary(split_at) {
            split_at -= 1;
        }
        if split_at == 0 {
            split_at = remaining.chars().next().map(char::len_utf8).unwrap_or(1);
        }

        let actual_split = remaining[..split_at]
            .rfind('\n')
            .or_else(|| remaining[..split_at].rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or(split_at);

        let piece = remaining[..actual_split].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        remaining = remaining[actual_split..].trim_start();
    }

    pieces
}

/// Line range of `piece`, a subslice of `parent` whose first line is `parent_start`.
fn piece_lines(parent: &str, piece: &str, parent_start: usize) -> (usize, usize) {
    let offset = (piece.as_ptr() as usize)
        .saturating_sub(parent.as_ptr() as usize)
        .min(parent.len());
    let start = parent_start + parent[..offset].matches('\n').count();
    (start, start + piece.matches('\n').count())
}

// ============ Paragraph strategy ============

fn paragraph_drafts(text: &str, max_chars: usize) -> Vec<Draft> {
    let mut drafts = Vec::new();
    let mut buf = String::new();
    let mut buf_start = 0;
    let mut buf_end = 0;

    let flush = |buf: &mut String, start: usize, end: usize, drafts: &mut Vec<Draft>| {
        if !buf.is_empty() {
            drafts.push(Draft {
                text: std::mem::take(buf),
                chunk_type: ChunkType::Text,
                header_path: Vec::new(),
                line_start: start,
                line_end: end,
                overlaps_prev: false,
            });
        }
    };

    for (para, ls, le) in paragraphs(text) {
        let would_be = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };

        if would_be > max_chars && !buf.is_empty() {
            flush(&mut buf, buf_start, buf_end, &mut drafts);
        }

        if para.len() > max_chars {
            flush(&mut buf, buf_start, buf_end, &mut drafts);
            for piece in hard_split(&para, max_chars) {
                let (ps, pe) = piece_lines(&para, piece, ls);
                drafts.push(Draft {
                    text: piece.to_string(),
                    chunk_type: ChunkType::Text,
                    header_path: Vec::new(),
                    line_start: ps,
                    line_end: pe,
                    overlaps_prev: false,
                });
            }
        } else {
            if buf.is_empty() {
                buf_start = ls;
            } else {
                buf.push_str("\n\n");
            }
            buf.push_str(&para);
            buf_end = le;
        }
    }

    flush(&mut buf, buf_start, buf_end, &mut drafts);
    drafts
}

/// Blank-line separated paragraphs with their 1-based line ranges.
fn paragraphs(text: &str) -> Vec<(String, usize, usize)> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut start = 0;

    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push((current.join("\n").trim().to_string(), start, i));
                current.clear();
            }
        } else {
            if current.is_empty() {
                start = i + 1;
            }
            current.push(line);
        }
    }
    if !current.is_empty() {
        let end = start + current.len() - 1;
        out.push((current.join("\n").trim().to_string(), start, end));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: FileRef<'static> = FileRef {
        collection_name: "docs",
        file_path: "guide.md",
    };

    fn structural(max_tokens: usize, overlap_fraction: f64, min_tokens: usize) -> ChunkingStrategy {
        ChunkingStrategy::Structural {
            max_tokens,
            overlap_fraction,
            min_tokens,
        }
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(chunk("", FILE, &structural(100, 0.25, 4)).is_empty());
        assert!(chunk("  \n\n \t\n", FILE, &structural(100, 0.25, 4)).is_empty());
        assert!(chunk("", FILE, &ChunkingStrategy::Paragraph { max_tokens: 100 }).is_empty());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk("Hello world", FILE, &structural(100, 0.25, 16));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello world");
        assert_eq!(chunks[0].chunk_type, ChunkType::Text);
        assert_eq!((chunks[0].line_start, chunks[0].line_end), (1, 1));
        assert!(chunks[0].overlap_source.is_empty());
    }

    #[test]
    fn test_deterministic_ids() {
        let text = "# Title\n\nAlpha paragraph.\n\n```rust\nfn main() {}\n```\n\nBeta paragraph.";
        let strategy = structural(10, 0.25, 1);
        let c1 = chunk(text, FILE, &strategy);
        let c2 = chunk(text, FILE, &strategy);
        let ids1: Vec<&str> = c1.iter().map(|c| c.id.as_str()).collect();
        let ids2: Vec<&str> = c2.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids1, ids2);
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_ids_scoped_by_collection_and_path() {
        let strategy = structural(100, 0.25, 4);
        let a = chunk("Same text", FILE, &strategy);
        let b = chunk(
            "Same text",
            FileRef {
                collection_name: "other",
                file_path: "guide.md",
            },
            &strategy,
        );
        let c = chunk(
            "Same text",
            FileRef {
                collection_name: "docs",
                file_path: "notes.md",
            },
            &strategy,
        );
        assert_ne!(a[0].id, b[0].id);
        assert_ne!(a[0].id, c[0].id);
        assert_eq!(a[0].content_hash, b[0].content_hash);
    }

    #[test]
    fn test_oversized_code_block_is_one_chunk() {
        let body: String = (0..200).map(|i| format!("let x{} = {};\n", i, i)).collect();
        let text = format!("Intro.\n\n```rust\n{}```\n\nOutro.", body);
        let chunks = chunk(&text, FILE, &structural(20, 0.25, 1));

        let code: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| c.chunk_type == ChunkType::Code)
            .collect();
        assert_eq!(code.len(), 1);
        assert!(code[0].text.starts_with("```rust"));
        assert!(code[0].text.ends_with("```"));
        assert!(code[0].text.contains("let x199 = 199;"));
        assert!(code[0].text.len() > 20 * CHARS_PER_TOKEN);
    }

    #[test]
    fn test_table_is_atomic_and_tagged() {
        let text = "Intro line.\n\n| a | b |\n|---|---|\n| 1 | 2 |\n| 3 | 4 |\n\nAfter.";
        let chunks = chunk(text, FILE, &structural(100, 0.0, 0));
        let table = chunks
            .iter()
            .find(|c| c.chunk_type == ChunkType::Table)
            .unwrap();
        assert_eq!(table.text.lines().count(), 4);
        assert_eq!((table.line_start, table.line_end), (3, 6));
    }

    #[test]
    fn test_heading_path() {
        let text = "# Guide\n\nIntro text here.\n\n## Install\n\nRun cargo install.\n\n# Other\n\nMore.";
        let chunks = chunk(text, FILE, &structural(100, 0.25, 1));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].header_path, vec!["Guide".to_string()]);
        assert_eq!(
            chunks[1].header_path,
            vec!["Guide".to_string(), "Install".to_string()]
        );
        assert!(chunks[1].text.starts_with("## Install"));
        assert_eq!(chunks[2].header_path, vec!["Other".to_string()]);
    }

    #[test]
    fn test_heading_only_document_still_chunks() {
        let chunks = chunk("# Just a title", FILE, &structural(100, 0.25, 16));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "# Just a title");
    }

    #[test]
    fn test_overlap_carried_and_linked() {
        let text = (0..6)
            .map(|i| format!("Sentence number {} talks about topics.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk(&text, FILE, &structural(20, 0.25, 1));
        assert!(chunks.len() > 2);

        for pair in chunks.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            assert!(next.overlap_source.contains(&prev.id));
            assert!(prev.overlap_source.contains(&next.id));
            let seed = next.text.split("\n\n").next().unwrap();
            assert!(!seed.is_empty());
            assert!(prev.text.ends_with(seed), "{:?} / {:?}", prev.text, seed);
        }
        for c in &chunks {
            assert!(c.text.len() <= 20 * CHARS_PER_TOKEN);
        }
    }

    #[test]
    fn test_no_overlap_when_fraction_zero() {
        let text = (0..6)
            .map(|i| format!("Sentence number {} talks about topics.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk(&text, FILE, &structural(20, 0.0, 1));
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.overlap_source.is_empty()));
    }

    #[test]
    fn test_small_trailing_fragment_merges() {
        let p1 = "a".repeat(70);
        let p2 = "b".repeat(78);
        let text = format!("{}\n\n{}\n\nok.", p1, p2);
        let chunks = chunk(&text, FILE, &structural(20, 0.0, 16));
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].text.ends_with("ok."));
        assert_eq!(chunks[1].line_end, 5);
    }

    #[test]
    fn test_list_chunk_type() {
        let chunks = chunk("- apples\n- pears\n- plums", FILE, &structural(100, 0.25, 1));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_type, ChunkType::List);
    }

    #[test]
    fn test_multibyte_hard_split_does_not_panic() {
        let text = "é".repeat(500);
        let chunks = chunk(&text, FILE, &structural(5, 0.25, 0));
        assert!(chunks.len() > 1);
        let rejoined: String = chunks.iter().map(|c| c.text.replace(char::is_whitespace, "")).collect();
        assert!(rejoined.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_paragraph_strategy_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk(text, FILE, &ChunkingStrategy::Paragraph { max_tokens: 700 });
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("Third paragraph."));
        assert_eq!((chunks[0].line_start, chunks[0].line_end), (1, 5));
    }

    #[test]
    fn test_paragraph_strategy_indices_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk(&text, FILE, &ChunkingStrategy::Paragraph { max_tokens: 10 });
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64, "Index mismatch at position {}", i);
        }
    }

    #[test]
    fn test_fingerprint_changes_with_parameters() {
        let a = structural(100, 0.25, 16).fingerprint();
        let b = structural(100, 0.20, 16).fingerprint();
        let c = ChunkingStrategy::Paragraph { max_tokens: 100 }.fingerprint();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, structural(100, 0.25, 16).fingerprint());
    }
}
