//! A fuzzy search/replace patch engine for language-model output.
//!
//! `srpatch` applies the `<<<<` / `====` / `>>>>` search-and-replace blocks
//! that code-editing models emit onto an existing file. Unlike a classic
//! `patch`, it never trusts the model's copy of the file byte-for-byte: the
//! "search" half of a block is located with a whitespace-tolerant sliding
//! window over the target lines, indentation is reconciled from the matched
//! snippet, and an elision marker (a line that is just `...`) lets a block
//! skip over unchanged regions.
//!
//! ## Getting Started
//!
//! The common case is a model response with one or more blocks, applied to
//! the current file content in memory:
//!
//! ```rust
//! use srpatch::apply_patch;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let original = "def f():\n    x = 1\n    return x";
//! let response = "<<<<\n    x = 1\n====\n    x = 2\n>>>>";
//!
//! let result = apply_patch(original, response, 0)?;
//! assert_eq!(result.new_content, "def f():\n    x = 2\n    return x");
//! assert!(result.report.all_applied_cleanly());
//! # Ok(())
//! # }
//! ```
//!
//! ## Per-hunk failure handling
//!
//! A block that cannot be placed does not abort the whole patch. Each hunk
//! produces a [`HunkApplyStatus`]; failures are reported, the remaining hunks
//! still run, and the caller decides what to do:
//!
//! ```rust
//! use srpatch::{apply_patch, HunkApplyError};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // The search block matches two disjoint windows; without context the
//! // engine refuses to guess.
//! let original = "a\nb\nx\na\nb";
//! let response = "<<<<\na\nb\n====\nc\n>>>>";
//!
//! let result = apply_patch(original, response, 0)?;
//! assert!(!result.report.all_applied_cleanly());
//! let failures = result.report.failures();
//! assert_eq!(failures[0].hunk_index, 1);
//! assert_eq!(failures[0].reason, HunkApplyError::MultipleHits);
//! // The content is left untouched.
//! assert_eq!(result.new_content, original);
//! # Ok(())
//! # }
//! ```
//!
//! ## Large files
//!
//! For files too large to hand to the model in one request, [`chunked_edit`]
//! splits the content into line chunks, asks an injected [`PatchProposer`]
//! for a patch per chunk, and reassembles the result. If any chunk of an
//! attempt fails, the whole file is retried at the next smaller chunk size
//! in the [`ChunkPlan`]; partial output from the failed attempt is discarded.
//!
//! ## Feature Flags
//!
//! ### `parallel`
//!
//! - **Enabled by default.**
//! - Scores fuzzy-match windows in parallel with
//!   [`rayon`](https://crates.io/crates/rayon). The reduction over scores is
//!   always sequential in index order, so results (including tie counts and
//!   first-occurrence tie-breaking) are identical with and without the
//!   feature. Disable with `default-features = false` for single-threaded
//!   targets.
use log::{debug, info, trace, warn};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use regex::Regex;
use similar::{DiffTag, TextDiff};
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;

/// A line whose trimmed content equals this marker means "unchanged content
/// omitted" inside a search/replace block.
pub const ELLIPSIS_MARKER: &str = "...";

// The wire grammar: an opening marker starting with four '<', the search
// text, a `====` separator (optionally followed by a trailer containing no
// '='), the replace text, a closing marker starting with four '>'. Non-greedy
// and repeatable. This pattern must stay byte-compatible with the prompts the
// models were tuned on, so do not "clean it up".
static PATCH_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<<<<.*?\n(.*?)\n====[^\n=]*\n(.*?)\n?>>>>").expect("static regex")
});

static NEW_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s).*?<new_file>\n?(.*)\n</new_file>").expect("static regex"));

static COPY_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<copy_lines\s(\d+)-(\d+)/?>").expect("static regex"));

// --- Error Types ---

/// Errors from the response-parsing entry points. These are the only "hard"
/// failures of an in-memory patch operation; when one is returned the
/// original content is left unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The model response contained no well-formed search/replace block.
    /// Malformed or unbalanced markers never produce partial hunks.
    #[error("no search/replace blocks found in model response")]
    NoBlocksFound,
    /// A regeneration response was expected but carried no `<new_file>` body.
    #[error("response did not contain a <new_file> body")]
    MissingFileBody,
}

/// The reason a single hunk failed to apply.
///
/// These are status values, not exceptions: a failed hunk leaves the line
/// sequence untouched and the next hunk still runs.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HunkApplyError {
    /// Not one line of the search block matched any window of the target,
    /// so there is no anchor at all for the edit.
    #[error("no line of the search block matched the target")]
    IdenticalLines,
    /// The matcher finished without producing a usable start index.
    #[error("no match location found")]
    NotFound,
    /// The search block matched several windows equally well and preceding
    /// context (if any) could not break the tie.
    #[error("search block matched at multiple locations")]
    MultipleHits,
}

/// An error from the injected patch-proposal collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProposeError {
    /// The model reported that the request exceeded its token limit.
    #[error("model reported the request exceeded its token limit")]
    TokenLimitExceeded,
    /// Any other proposal failure (transport, refusal, upstream timeout).
    #[error("patch proposal failed: {0}")]
    Failed(String),
}

/// A chunked edit that could not be completed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkedEditError {
    /// The single-request (non-chunked) path overflowed the model's token
    /// limit. Smaller chunk sizes cannot fix an oversized single request,
    /// so this propagates immediately instead of backing off.
    #[error("model reported the request exceeded its token limit")]
    TokenLimitExceeded,
    /// Every candidate chunk size failed. No partial output is ever kept.
    #[error("every chunk size failed for this edit (tried {tried:?})")]
    ChunkSizesExhausted { tried: Vec<usize> },
}

/// Why one chunk-size attempt had to be abandoned.
#[derive(Error, Debug)]
enum ChunkFailure {
    #[error(transparent)]
    Propose(#[from] ProposeError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

// --- Data Structures ---

/// One search/replace pair extracted from a model response.
///
/// `context_before` is only populated by the interior-ellipsis split: when a
/// block is cut at a `...` line, the lines before the cut are remembered so
/// an ambiguous match of the trailing part can be re-anchored near them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// The lines the model claims are in the file.
    pub search: Vec<String>,
    /// The lines that should replace the matched window.
    pub replace: Vec<String>,
    /// Lines preceding this hunk in the original block, used to
    /// disambiguate a multi-hit match.
    pub context_before: Option<Vec<String>>,
}

impl Hunk {
    /// Creates a hunk from pre-split line vectors.
    pub fn new(search: Vec<String>, replace: Vec<String>) -> Self {
        Self {
            search,
            replace,
            context_before: None,
        }
    }

    /// Creates a hunk from the raw search/replace text of one block,
    /// stripping an echoed `<old_file>` wrapper when it appears on both
    /// sides.
    ///
    /// # Example
    ///
    /// ```
    /// # use srpatch::Hunk;
    /// let hunk = Hunk::from_raw("<old_file>foo", "<old_file>bar");
    /// assert_eq!(hunk.search, vec!["foo"]);
    /// assert_eq!(hunk.replace, vec!["bar"]);
    /// ```
    pub fn from_raw(search: &str, replace: &str) -> Self {
        let (search, replace) = strip_old_file_tags(search, replace);
        Self::new(split_lines(&search), split_lines(&replace))
    }
}

/// The outcome of one sliding-window scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchCandidate {
    /// Start index of the first best-scoring window, or `None` if no index
    /// was ever visited (degenerate empty scan range).
    pub start_index: Option<usize>,
    /// Count of lines whose trimmed content matched, plus a 0.01 bonus per
    /// exact (untrimmed) match during a disambiguation re-scan. The bonus
    /// only breaks ties toward exact-whitespace windows; it never changes
    /// the primary ranking.
    pub similarity: f64,
    /// Number of distinct start indices achieving the maximum score.
    pub tie_count: usize,
}

/// The result of applying a single hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkApplyStatus {
    /// The hunk was spliced in at this start index of the (pre-splice)
    /// line sequence.
    Applied {
        /// 0-based start index of the replaced window.
        index: usize,
    },
    /// The hunk could not be placed and the line sequence is unchanged.
    /// For a hunk split at an interior elision marker, the failure may come
    /// from either half; the other half may still have been applied.
    Failed(HunkApplyError),
}

/// Details about a hunk that failed to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkFailure {
    /// The 1-based index of the hunk that failed.
    pub hunk_index: usize,
    /// The reason for the failure.
    pub reason: HunkApplyError,
}

/// Per-hunk results of one patch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// One status per hunk, in application order.
    pub hunk_results: Vec<HunkApplyStatus>,
}

impl ApplyReport {
    /// `true` when no hunk failed.
    pub fn all_applied_cleanly(&self) -> bool {
        self.hunk_results
            .iter()
            .all(|r| !matches!(r, HunkApplyStatus::Failed(_)))
    }

    /// Returns every failed hunk with its 1-based index.
    pub fn failures(&self) -> Vec<HunkFailure> {
        self.hunk_results
            .iter()
            .enumerate()
            .filter_map(|(i, status)| {
                if let HunkApplyStatus::Failed(reason) = status {
                    Some(HunkFailure {
                        hunk_index: i + 1,
                        reason: *reason,
                    })
                } else {
                    None
                }
            })
            .collect()
    }
}

/// The result of an in-memory patch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    /// The content after applying every hunk that could be placed.
    pub new_content: String,
    /// Per-hunk statuses.
    pub report: ApplyReport,
}

/// The ordered chunk line-counts to try, largest first, for one file edit.
///
/// The orchestrator commits to the first size whose full chunk loop
/// completes; output from failed larger sizes is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Candidate chunk sizes in lines, strictly decreasing.
    pub sizes: Vec<usize>,
}

impl Default for ChunkPlan {
    fn default() -> Self {
        Self {
            sizes: vec![800, 600, 400],
        }
    }
}

impl ChunkPlan {
    /// Creates a plan from explicit candidate sizes.
    pub fn new(sizes: Vec<usize>) -> Self {
        Self { sizes }
    }
}

// --- Collaborator Interface ---

/// The external collaborator that produces patch proposals for a chunk.
///
/// Implementations wrap whatever actually talks to the model. The engine
/// never performs I/O itself; it only consumes the returned response text.
pub trait PatchProposer {
    /// Requests a raw model response containing search/replace blocks for
    /// `chunk` given the edit `instructions`.
    fn propose_patch(&mut self, chunk: &str, instructions: &str) -> Result<String, ProposeError>;

    /// Cheap relevance pre-filter. Returning `false` passes the chunk
    /// through unchanged without requesting a proposal.
    fn should_edit(&mut self, _instructions: &str, _chunk: &str) -> bool {
        true
    }
}

// --- Core Logic ---

/// Extracts the ordered (search, replace) text pairs from a raw model
/// response.
///
/// Blocks are matched non-greedily, first to last. Anything that does not
/// form a complete block is ignored; there is no partial-hunk recovery.
///
/// # Example
///
/// ```
/// # use srpatch::parse_patch_blocks;
/// let response = "Here is the fix:\n<<<<\nold\n====\nnew\n>>>>\ndone.";
/// let blocks = parse_patch_blocks(response);
/// assert_eq!(blocks, vec![("old".to_string(), "new".to_string())]);
/// ```
pub fn parse_patch_blocks(raw_text: &str) -> Vec<(String, String)> {
    PATCH_BLOCK_RE
        .captures_iter(raw_text)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

/// Re-emits the raw search/replace blocks of a response verbatim, separated
/// by blank lines. Useful for showing a model its own proposed edits in a
/// follow-up prompt.
pub fn raw_patch_blocks(raw_text: &str) -> String {
    let blocks: Vec<&str> = PATCH_BLOCK_RE
        .find_iter(raw_text)
        .map(|m| m.as_str())
        .collect();
    blocks.join("\n\n")
}

/// Applies every search/replace block of `response` to `original`, in order.
///
/// This is the top-level entry point. Hunks are applied left to right
/// against the already-modified line sequence; a failed hunk is recorded in
/// the report and skipped. Two special cases short-circuit the hunk loop:
///
/// - An empty (whitespace-only) `original` takes the first hunk's replace
///   text verbatim: creating a file is structurally a full replacement.
/// - A response carrying a `<new_file>` body is a whole-file regeneration
///   and is routed through [`regenerate_file`], where `chunk_offset`
///   corrects any absolute line references the model echoed.
///
/// `chunk_offset` is the starting line of this content within the whole
/// file when chunked editing is in effect; pass 0 otherwise.
///
/// # Errors
///
/// [`ParseError::NoBlocksFound`] when the response has no well-formed block;
/// the caller's content is left unchanged.
pub fn apply_patch(
    original: &str,
    response: &str,
    chunk_offset: usize,
) -> Result<PatchOutcome, ParseError> {
    if NEW_FILE_RE.is_match(response) {
        let new_content = regenerate_file(response, original, chunk_offset)?;
        return Ok(PatchOutcome {
            new_content,
            report: ApplyReport {
                hunk_results: vec![HunkApplyStatus::Applied { index: 0 }],
            },
        });
    }

    let blocks = parse_patch_blocks(response);
    if blocks.is_empty() {
        return Err(ParseError::NoBlocksFound);
    }

    if original.trim().is_empty() {
        // Empty file: creation is a full replacement, not a patch. The
        // replace text is taken verbatim, echoed wrapper tags included.
        debug!("original is empty; taking first block's replace text verbatim");
        let (_, replace) = &blocks[0];
        return Ok(PatchOutcome {
            new_content: replace.clone(),
            report: ApplyReport {
                hunk_results: vec![HunkApplyStatus::Applied { index: 0 }],
            },
        });
    }

    let mut lines: Vec<String> = original.lines().map(String::from).collect();
    let total = blocks.len();
    let mut hunk_results = Vec::with_capacity(total);
    for (i, (search, replace)) in blocks.iter().enumerate() {
        debug!("applying hunk {}/{}", i + 1, total);
        let hunk = Hunk::from_raw(search, replace);
        let status = apply_hunk_to_lines(&hunk, &mut lines);
        if let HunkApplyStatus::Failed(reason) = &status {
            warn!("hunk {}/{} failed: {}", i + 1, total, reason);
        }
        hunk_results.push(status);
    }

    Ok(PatchOutcome {
        new_content: lines.join("\n"),
        report: ApplyReport { hunk_results },
    })
}

/// Applies a single hunk to a mutable line sequence in place.
///
/// The ellipsis marker is handled first (see [`ELLIPSIS_MARKER`]): an edge
/// marker mirrored in search and replace is dropped from both; a marker at
/// an interior position in both splits the hunk into a trailing part
/// (applied first, anchored by the leading lines as context) and a leading
/// part. If either half of a split fails, the hunk reports that failure,
/// even though the other half may already have been spliced in. Splitting
/// is skipped entirely when the target itself contains a marker line,
/// since `...` would then be real content.
///
/// Matching always scans from the start of the current sequence; there is
/// no floor below already-applied hunks. This tolerates reordered blocks
/// but can in principle re-match earlier text; callers rely on the
/// first-occurrence tie-breaking, so the behavior is kept as-is.
pub fn apply_hunk_to_lines(hunk: &Hunk, lines: &mut Vec<String>) -> HunkApplyStatus {
    apply_once(
        lines,
        &hunk.search,
        &hunk.replace,
        hunk.context_before.as_deref(),
    )
}

fn apply_once(
    lines: &mut Vec<String>,
    search: &[String],
    replace: &[String],
    context_before: Option<&[String]>,
) -> HunkApplyStatus {
    let mut search = search.to_vec();
    let mut replace = replace.to_vec();
    let mut context: Option<Vec<String>> = context_before.map(<[String]>::to_vec);
    let mut trailing_status: Option<HunkApplyStatus> = None;

    // Elision handling is only safe when the target never uses the marker
    // as real content.
    if !lines.iter().any(|l| l.trim() == ELLIPSIS_MARKER) {
        let in_search = search.iter().position(|l| l.trim() == ELLIPSIS_MARKER);
        let in_replace = replace.iter().position(|l| l.trim() == ELLIPSIS_MARKER);
        if let (Some(si), Some(ri)) = (in_search, in_replace) {
            if si == 0 && ri == 0 {
                search.remove(0);
                replace.remove(0);
            } else if si + 1 == search.len() && ri + 1 == replace.len() {
                search.truncate(si);
                replace.truncate(ri);
            } else if si > 0 && si + 1 < search.len() && ri > 0 && ri + 1 < replace.len() {
                // Interior in both: resolve the trailing part first, using
                // the lines before the marker as its anchor context. A
                // failure here is reported even when the leading part lands.
                trace!("splitting hunk at interior elision marker (search line {si})");
                context = Some(search[..si].to_vec());
                let trailing_search = search[si + 1..].to_vec();
                let trailing_replace = replace[ri + 1..].to_vec();
                trailing_status = Some(apply_once(
                    lines,
                    &trailing_search,
                    &trailing_replace,
                    context.as_deref(),
                ));
                search.truncate(si);
                replace.truncate(ri);
            }
            // Any other marker arrangement: match the hunk as-is.
        }
    }

    let mut candidate = match_lines(lines, &search, None);

    if candidate.similarity == 0.0 {
        warn!("no identical lines between search block and target");
        return HunkApplyStatus::Failed(HunkApplyError::IdenticalLines);
    }
    if candidate.tie_count > 1 {
        let mut resolved = false;
        if let Some(context) = context.as_ref().filter(|c| !c.is_empty()) {
            let anchor = match_lines(lines, context, None);
            if anchor.tie_count == 1 {
                if let Some(anchor_index) = anchor.start_index {
                    // Re-scan strictly after the context's end, with the
                    // context's resolved indentation prefixed to every
                    // search line. Only the first qualifying position is
                    // accepted.
                    let (_, anchor_spaces, _) = snippet_padding(lines, anchor_index, context);
                    let padded: Vec<String> = search
                        .iter()
                        .map(|s| format!("{anchor_spaces}{s}"))
                        .collect();
                    let rescanned =
                        match_lines(lines, &padded, Some(anchor_index + context.len()));
                    candidate = MatchCandidate {
                        tie_count: 1,
                        ..rescanned
                    };
                    resolved = true;
                }
            }
        }
        if !resolved {
            warn!(
                "search block matched {} locations and no context could break the tie",
                candidate.tie_count
            );
            return HunkApplyStatus::Failed(HunkApplyError::MultipleHits);
        }
    }
    let Some(index) = candidate.start_index else {
        return HunkApplyStatus::Failed(HunkApplyError::NotFound);
    };

    let (_, spaces, strip) = snippet_padding(lines, index, &search);
    let modified: Vec<String> = if strip {
        let min_ws = search
            .iter()
            .map(|s| leading_spaces_width(s))
            .min()
            .unwrap_or(0);
        replace
            .iter()
            .map(|line| format!("{spaces}{}", lstrip_max(line, min_ws)))
            .collect()
    } else {
        replace
            .iter()
            .map(|line| format!("{spaces}{line}"))
            .collect()
    };

    let end = (index + search.len()).min(lines.len());
    lines.splice(index..end, modified);

    // The trailing half of a split hunk failed: report it rather than the
    // leading half's clean match.
    if let Some(HunkApplyStatus::Failed(reason)) = trailing_status {
        return HunkApplyStatus::Failed(reason);
    }
    HunkApplyStatus::Applied { index }
}

/// Scores every window of `original` against `search` and returns the first
/// best-scoring start index, the best score, and how many windows tied it.
///
/// Each line pair contributes 1 when the trimmed contents are equal. When
/// `start_index` is `Some` (the disambiguation re-scan), an exact untrimmed
/// match adds a further 0.01 so ties break toward exact-whitespace windows.
/// The scan is a deliberate O(N·M) full comparison: model-authored search
/// blocks are tens of lines at most, and the simplicity beats suffix-array
/// or rolling-hash machinery.
///
/// # Example
///
/// ```
/// # use srpatch::match_lines;
/// let original = vec!["fn main() {", "    work();", "}"];
/// let search = vec!["work();"];
/// let m = match_lines(&original, &search, None);
/// assert_eq!(m.start_index, Some(1));
/// assert_eq!(m.similarity, 1.0);
/// assert_eq!(m.tie_count, 1);
/// ```
pub fn match_lines<O, S>(original: &[O], search: &[S], start_index: Option<usize>) -> MatchCandidate
where
    O: AsRef<str> + Sync,
    S: AsRef<str> + Sync,
{
    let start = start_index.unwrap_or(0);
    let exact_bonus = start_index.is_some();
    trace!(
        "match_lines: {} target lines, {} search lines, start {}",
        original.len(),
        search.len(),
        start
    );

    let score_at = |i: usize| -> f64 {
        let mut count = 0.0;
        for (j, s) in search.iter().enumerate() {
            if i + j >= original.len() {
                break;
            }
            let s = s.as_ref();
            let o = original[i + j].as_ref();
            if s.trim() == o.trim() {
                count += 1.0;
                if exact_bonus && s == o {
                    count += 0.01;
                }
            }
        }
        count
    };

    #[cfg(feature = "parallel")]
    let scores: Vec<f64> = (start..original.len())
        .into_par_iter()
        .map(score_at)
        .collect();
    #[cfg(not(feature = "parallel"))]
    let scores: Vec<f64> = (start..original.len()).map(score_at).collect();

    // Sequential reduction keeps first-occurrence and tie-count semantics
    // identical regardless of how the scores were computed.
    let mut best = MatchCandidate {
        start_index: None,
        similarity: 0.0,
        tie_count: 0,
    };
    for (offset, &score) in scores.iter().enumerate() {
        if score > best.similarity {
            best.start_index = Some(start + offset);
            best.similarity = score;
            best.tie_count = 1;
        } else if score == best.similarity {
            best.tie_count += 1;
        }
    }
    best
}

/// Extracts the matched original window and decides how replacement
/// indentation is rebuilt.
///
/// If the first search line carries no leading whitespace, the first matched
/// line's indentation becomes the shared prefix and replacement lines are
/// used as-is behind it. Otherwise the minimum leading-space width across
/// the search lines becomes the prefix, and each replacement line is first
/// stripped of at most that many leading spaces (the model kept relative
/// indentation but lost the absolute base).
fn snippet_padding(
    original: &[String],
    index: usize,
    search: &[String],
) -> (Vec<String>, String, bool) {
    let end = (index + search.len()).min(original.len());
    let snippet: Vec<String> = original[index..end].to_vec();

    let first_search_ws = search.first().map_or(0, |s| leading_spaces_width(s));
    if first_search_ws == 0 {
        let width = snippet.first().map_or(0, |s| leading_spaces_width(s));
        (snippet, " ".repeat(width), false)
    } else {
        let min_ws = search
            .iter()
            .map(|s| leading_spaces_width(s))
            .min()
            .unwrap_or(0);
        (snippet, " ".repeat(min_ws), true)
    }
}

fn leading_spaces_width(s: &str) -> usize {
    s.len() - s.trim_start().len()
}

/// Strips at most `max_count` leading space characters.
fn lstrip_max(s: &str, max_count: usize) -> &str {
    let mut stripped = 0;
    for (i, ch) in s.char_indices() {
        if ch == ' ' && stripped < max_count {
            stripped += 1;
        } else {
            return &s[i..];
        }
    }
    &s[s.len()..]
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines().map(String::from).collect()
}

fn strip_old_file_tags(search: &str, replace: &str) -> (String, String) {
    const OPEN: &str = "<old_file>";
    const CLOSE: &str = "</old_file>";
    let mut search = search.to_string();
    let mut replace = replace.to_string();

    if search.trim_start().starts_with(OPEN) && replace.trim_start().starts_with(OPEN) {
        search = search.trim_start()[OPEN.len()..].to_string();
        replace = replace.trim_start()[OPEN.len()..].to_string();
    }
    if search.trim_end().ends_with(CLOSE) && replace.trim_end().ends_with(CLOSE) {
        let s = search.trim_end();
        search = s[..s.len() - CLOSE.len()].to_string();
        let r = replace.trim_end();
        replace = r[..r.len() - CLOSE.len()].to_string();
    }
    (search, replace)
}

/// Rebuilds a whole file from a `<new_file>` regeneration response.
///
/// `<copy_lines a-b/>` markers are expanded from the original content using
/// 1-based inclusive bounds. When `chunk_offset` is non-zero it is
/// subtracted from both bounds first: the model only saw the chunk's local
/// numbering but may echo file-global numbers. Bounds are clamped to the
/// file. A model-authored line that duplicates the last line of a preceding
/// copy expansion is dropped, since models tend to re-emit the boundary
/// line.
///
/// # Errors
///
/// [`ParseError::MissingFileBody`] when the response has no `<new_file>`
/// body.
pub fn regenerate_file(
    response: &str,
    original: &str,
    chunk_offset: usize,
) -> Result<String, ParseError> {
    let body = NEW_FILE_RE
        .captures(response)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or(ParseError::MissingFileBody)?;

    if !body.contains("<copy_lines") {
        return Ok(body.to_string());
    }

    let old_lines: Vec<&str> = original.lines().collect();
    let mut result: Vec<String> = Vec::new();

    for raw_line in body.split('\n') {
        let mut line = raw_line.to_string();
        let mut copied_lines = false;

        let markers: Vec<(String, usize, usize)> = COPY_LINES_RE
            .captures_iter(raw_line)
            .filter_map(|caps| {
                let whole = caps.get(0)?.as_str().to_string();
                let start = caps.get(1)?.as_str().parse::<usize>().ok()?;
                let end = caps.get(2)?.as_str().parse::<usize>().ok()?;
                Some((whole, start, end))
            })
            .collect();

        for (marker_text, start_1based, end_1based) in markers {
            copied_lines = true;
            let mut start = start_1based as isize - 1;
            let mut end = end_1based as isize - 1;
            if chunk_offset != 0 {
                // The model echoed file-global numbers from a chunked view.
                start -= chunk_offset as isize;
                end -= chunk_offset as isize;
            }
            let start = start.max(0) as usize;
            let end = end.min(old_lines.len() as isize - 1);

            let replacement = if old_lines.is_empty() || end < start as isize {
                String::new()
            } else {
                old_lines[start..=end as usize].join("\n")
            };
            line = line.replace(&marker_text, &replacement);
        }

        // Models sometimes re-emit the line that closed the previous copy
        // expansion; drop the duplicate.
        let mut append = true;
        if !copied_lines {
            if let Some(last_group) = result.last() {
                if let Some(pos) = last_group.rfind('\n') {
                    if last_group[pos + 1..] == line {
                        append = false;
                    }
                }
            }
        }
        if append {
            result.push(line);
        }
    }

    Ok(result.join("\n"))
}

/// Strips wrapping code-fence and `user_code` tag artifacts the model may
/// echo around whole-file output.
///
/// Only the first and last three lines are scanned; files of five lines or
/// fewer get a simplified single fence-strip pass. Markdown content is
/// returned untouched, since fences are legitimate there.
///
/// # Example
///
/// ```
/// # use srpatch::sanitize_contents;
/// let text = "```python\nline 1\nline 2\nline 3\nline 4\nline 5\nline 6\n```";
/// assert_eq!(
///     sanitize_contents(text, false),
///     "line 1\nline 2\nline 3\nline 4\nline 5\nline 6"
/// );
/// ```
pub fn sanitize_contents(text: &str, is_markdown: bool) -> String {
    let lines: Vec<&str> = text.split('\n').collect();

    if is_markdown {
        return lines.join("\n");
    }

    // Small files: a single fence-strip pass.
    if lines.len() <= 5 {
        let mut start_idx = 0;
        let mut end_idx = lines.len();
        for (idx, line) in lines.iter().enumerate() {
            if start_idx == 0 && line.trim().starts_with("```") {
                start_idx = idx + 1;
            }
            if start_idx != 0 && line.trim().ends_with("```") {
                end_idx = idx;
            }
        }
        if end_idx <= start_idx {
            return String::new();
        }
        return lines[start_idx..end_idx].join("\n");
    }

    let first_three = &lines[..3];
    let last_three = &lines[lines.len() - 3..];
    let mut first_line_idx = 0;
    let mut last_line_idx = 3;
    for (idx, line) in first_three.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            first_line_idx = first_line_idx.max(idx + 1);
        }
        if trimmed.contains("user_code>") {
            first_line_idx = first_line_idx.max(idx + 1);
        }
    }
    for (idx, line) in last_three.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.ends_with("```") {
            last_line_idx = last_line_idx.min(idx);
        }
        if trimmed.contains("user_code>") {
            last_line_idx = last_line_idx.min(idx);
        }
    }

    let mut kept: Vec<&str> = Vec::with_capacity(lines.len());
    kept.extend(&first_three[first_line_idx..]);
    kept.extend(&lines[3..lines.len() - 3]);
    kept.extend(&last_three[..last_line_idx]);
    kept.join("\n")
}

/// Whether sanitization should treat this path as markdown-like content.
pub fn is_markdown_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("md" | "rst" | "txt")
    )
}

// --- Chunked Editing ---

/// Edits a file's content by requesting and applying one patch per chunk,
/// backing off to smaller chunk sizes when an attempt fails.
///
/// A file is chunked only when its line count exceeds 1.5x the candidate
/// size; otherwise a single proposal covers the whole content. For each
/// chunk, `proposer.should_edit` may skip the request entirely (the chunk
/// passes through unchanged). Chunk results are joined with a newline
/// separator between chunks but not after the last one.
///
/// Any failure inside one size's chunk loop (an unusable proposal, an
/// unparsable response) abandons that size and restarts the whole file at
/// the next smaller size, discarding all partial progress. Token-limit
/// overflow in the chunked loop is just another chunk failure (smaller
/// chunks shrink the request); in the non-chunked path it is fatal and
/// propagates immediately.
///
/// # Errors
///
/// [`ChunkedEditError::ChunkSizesExhausted`] when no candidate size
/// completes, or [`ChunkedEditError::TokenLimitExceeded`] from the
/// non-chunked path.
pub fn chunked_edit(
    proposer: &mut dyn PatchProposer,
    file_name: &str,
    contents: &str,
    instructions: &str,
    plan: &ChunkPlan,
) -> Result<String, ChunkedEditError> {
    let markdown = is_markdown_path(Path::new(file_name));
    let lines: Vec<&str> = contents.split('\n').collect();

    for &size in &plan.sizes {
        let chunking = lines.len() as f64 > size as f64 * 1.5;
        debug!(
            "edit attempt for '{}': chunk size {}, {} lines, chunking: {}",
            file_name,
            size,
            lines.len(),
            chunking
        );

        if !chunking {
            let response = match proposer.propose_patch(contents, instructions) {
                Ok(response) => response,
                Err(ProposeError::TokenLimitExceeded) => {
                    return Err(ChunkedEditError::TokenLimitExceeded);
                }
                Err(ProposeError::Failed(reason)) => {
                    warn!("proposal failed: {reason}");
                    continue;
                }
            };
            match apply_patch(contents, &response, 0) {
                Ok(outcome) => {
                    info!("edit for '{}' completed without chunking", file_name);
                    return Ok(sanitize_contents(&outcome.new_content, markdown));
                }
                Err(e) => {
                    warn!("could not apply proposal: {e}");
                    continue;
                }
            }
        }

        match edit_in_chunks(proposer, &lines, instructions, size, markdown) {
            Ok(new_contents) => {
                info!("edit for '{}' completed at chunk size {}", file_name, size);
                return Ok(new_contents);
            }
            Err(e) => {
                // Partial progress from this size is dropped on the floor.
                warn!("chunk size {size} failed ({e}); backing off");
                continue;
            }
        }
    }

    Err(ChunkedEditError::ChunkSizesExhausted {
        tried: plan.sizes.clone(),
    })
}

/// One full pass over the file at a fixed chunk size. Any error here
/// abandons the whole attempt; the accumulated output is discarded by the
/// caller.
fn edit_in_chunks(
    proposer: &mut dyn PatchProposer,
    lines: &[&str],
    instructions: &str,
    size: usize,
    markdown: bool,
) -> Result<String, ChunkFailure> {
    let mut accumulated = String::new();
    let mut i = 0;
    while i < lines.len() {
        let end = (i + size).min(lines.len());
        let chunk = lines[i..end].join("\n");

        let new_chunk = if !proposer.should_edit(instructions, &chunk) {
            trace!("chunk at line {i} reported irrelevant; passing through");
            chunk
        } else {
            let response = proposer.propose_patch(&chunk, instructions)?;
            // The model saw this chunk with local numbering; `i` corrects
            // any file-global references it echoes.
            let outcome = apply_patch(&chunk, &response, i)?;
            sanitize_contents(&outcome.new_content, markdown)
        };

        accumulated.push_str(&new_chunk);
        if i + size < lines.len() {
            accumulated.push('\n');
        }
        i += size;
    }
    Ok(accumulated)
}

// --- Diff Utilities ---

/// Generates a unified diff of the two texts, trimmed of surrounding
/// whitespace first.
pub fn generate_diff(old_code: &str, new_code: &str) -> String {
    let old_code = old_code.trim();
    let new_code = new_code.trim();
    TextDiff::from_lines(old_code, new_code)
        .unified_diff()
        .to_string()
}

/// Undoes whitespace-only churn: keeps the original lines wherever the
/// modified text merely reflowed or re-indented them, and keeps inserted
/// lines only when they carry content.
pub fn revert_whitespace_changes(original: &str, modified: &str) -> String {
    let original_lines: Vec<&str> = original.lines().collect();
    let modified_lines: Vec<&str> = modified.lines().collect();
    let diff = TextDiff::from_slices(&original_lines, &modified_lines);

    let mut final_lines: Vec<&str> = Vec::new();
    for op in diff.ops() {
        match op.tag() {
            // Equal or replaced regions: not a whitespace-only change, so
            // the original lines win.
            DiffTag::Equal | DiffTag::Replace => {
                final_lines.extend(&original_lines[op.old_range()]);
            }
            DiffTag::Insert => {
                for line in &modified_lines[op.new_range()] {
                    if !line.trim().is_empty() {
                        final_lines.push(line);
                    }
                }
            }
            DiffTag::Delete => {}
        }
    }
    final_lines.join("\n")
}

/// Flags a proposed diff that removes lines, or adds a line that already
/// occurs more than once in the new code (a sign the model duplicated
/// content instead of editing it).
pub fn diff_contains_dups_or_removals(diff: &str, new_code: &str) -> bool {
    // Skip the diff header.
    let diff_lines: Vec<&str> = diff.split('\n').skip(3).collect();
    let new_code_lines: Vec<&str> = new_code.split('\n').map(str::trim).collect();

    let lines_removed = diff_lines.iter().any(|l| l.starts_with('-'));
    let duplicate_lines_added = diff_lines
        .iter()
        .filter(|l| l.starts_with('+'))
        .map(|l| l[1..].trim())
        .any(|added| new_code_lines.iter().filter(|l| **l == added).count() > 1);

    lines_removed || duplicate_lines_added
}

/// Joins two chunk texts, removing up to `k` duplicated boundary lines
/// (the largest overlap wins).
pub fn join_contents_overlap(first: &str, second: &str, k: usize) -> String {
    let first_lines: Vec<&str> = first.lines().collect();
    let second_lines: Vec<&str> = second.lines().collect();

    if first_lines.len() >= k && second_lines.len() >= k {
        for i in (1..=k).rev() {
            if first_lines[first_lines.len() - i..] == second_lines[..i] {
                return format!(
                    "{}\n{}",
                    first_lines.join("\n"),
                    second_lines[i..].join("\n")
                );
            }
        }
    }
    format!("{}\n{}", first_lines.join("\n"), second_lines.join("\n"))
}
