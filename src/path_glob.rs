//! Multi-segment path patterns and the directory crawler.
//!
//! A pattern string such as `src/(**/*).cpp` describes complete file paths:
//! an ordered list of directory-level segments, each one an entity-name glob
//! optionally preceded by a `**` directory wildcard, plus capture groups
//! delimited by parentheses. The crawler walks the filesystem through an
//! injected [`DirectoryReader`] and yields every file matching one of the
//! patterns, along with the byte ranges captured by its groups.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::mem;

use thiserror::Error;

use crate::glob;
use crate::io::{DirEnt, DirectoryReader, EntKind};

/// The kind of path location a capture group boundary points at: the full
/// extent of a `**` wildcard, or an offset inside an entity-name match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePointKind {
    Wildcard,
    EntName,
}

/// Where a capture group starts or ends within a path pattern. For example in
/// `src/(**/*).cpp` the single group starts at the wildcard of the second
/// segment and ends inside that segment's entity name, right before `.cpp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePoint {
    /// Index of the pattern segment; the parser guarantees it points at an
    /// existing segment.
    pub segment_ix: usize,
    pub kind: CapturePointKind,
    /// Only meaningful for `EntName` points: the entity-name sub-segment at
    /// which the capture starts or ends.
    pub ent_name_segment_ix: usize,
}

impl CapturePoint {
    pub fn wildcard(segment_ix: usize) -> CapturePoint {
        CapturePoint { segment_ix, kind: CapturePointKind::Wildcard, ent_name_segment_ix: 0 }
    }

    pub fn ent_name(segment_ix: usize, ent_name_segment_ix: usize) -> CapturePoint {
        CapturePoint { segment_ix, kind: CapturePointKind::EntName, ent_name_segment_ix }
    }

    fn is_wildcard(&self, target_segment_ix: usize) -> bool {
        self.kind == CapturePointKind::Wildcard && self.segment_ix == target_segment_ix
    }

    fn is_ent_name(&self, target_segment_ix: usize) -> bool {
        self.kind == CapturePointKind::EntName && self.segment_ix == target_segment_ix
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureGroup {
    pub from: CapturePoint,
    pub to: CapturePoint,
}

/// One directory level of a path pattern: the entity-name glob, and whether
/// the level also matches any run of intermediate directories (`**`). An
/// entity is allowed to match both the wildcard and the name pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    pub ent_name: glob::Pattern,
    pub has_wildcard: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pattern {
    pub capture_groups: Vec<CaptureGroup>,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("duplicate directory wildcard `**/**`")]
    DuplicateDirectoryWildcard,
    #[error("duplicate wildcard `**` inside an entity name")]
    DuplicateWildcard,
    #[error("escape character `\\` at the end of the pattern")]
    EscapeCharAtEnd,
    #[error("unexpected capture group closing parenthesis")]
    UnexpectedCaptureClose,
    #[error("unclosed capture group")]
    UnclosedCaptureGroup,
    #[error("closing a capture group right after `**` is not supported")]
    WildcardCaptureClose,
}

struct Parser<'a> {
    input: &'a [u8],
    input_ix: usize,
    current_segment: Segment,
    current_glob_segment: glob::Segment,
    result: Pattern,
    capture_group_ids: Vec<usize>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Parser<'a> {
        Parser {
            input: input.as_bytes(),
            input_ix: 0,
            current_segment: Segment::default(),
            current_glob_segment: glob::Segment::default(),
            result: Pattern::default(),
            capture_group_ids: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Pattern, ParseError> {
        self.read_path_segment()?;
        while !self.current_segment.ent_name.is_empty() {
            let segment = mem::take(&mut self.current_segment);
            self.result.segments.push(segment);
            self.read_path_segment()?;
        }
        if !self.capture_group_ids.is_empty() {
            return Err(ParseError::UnclosedCaptureGroup);
        }
        Ok(self.result)
    }

    fn read_path_segment(&mut self) -> Result<(), ParseError> {
        self.current_segment.ent_name.clear();
        self.current_segment.has_wildcard = self.read_directory_wildcard()?;
        if self.read_directory_wildcard()? {
            return Err(ParseError::DuplicateDirectoryWildcard);
        }
        while self.input_ix < self.input.len() && self.input[self.input_ix] != b'/' {
            self.process_input_char()?;
            self.input_ix += 1;
        }
        self.finish_glob_segment();
        if self.input_ix < self.input.len() {
            self.input_ix += 1;
        }
        Ok(())
    }

    fn process_input_char(&mut self) -> Result<(), ParseError> {
        match self.input[self.input_ix] {
            b'*' => {
                if self.current_glob_segment.prefix == glob::Placeholder::Wildcard
                    && self.current_glob_segment.literal.is_empty()
                {
                    return Err(ParseError::DuplicateWildcard);
                }
                self.finish_glob_segment();
                self.current_glob_segment.prefix = glob::Placeholder::Wildcard;
            }
            b'?' => {
                self.finish_glob_segment();
                self.current_glob_segment.prefix = glob::Placeholder::SingleWildcard;
            }
            b'(' => self.open_capture_group_in_name(),
            b')' => self.close_capture_group()?,
            c => {
                let c = if c == b'\\' {
                    self.input_ix += 1;
                    if self.input_ix == self.input.len() {
                        return Err(ParseError::EscapeCharAtEnd);
                    }
                    self.input[self.input_ix]
                } else {
                    c
                };
                self.current_glob_segment.literal.push(c as char);
            }
        }
        Ok(())
    }

    fn open_capture_group_in_name(&mut self) {
        self.finish_glob_segment();
        let from = CapturePoint::ent_name(
            self.result.segments.len(),
            self.current_segment.ent_name.len(),
        );
        self.open_capture_group(from);
    }

    fn close_capture_group(&mut self) -> Result<(), ParseError> {
        self.finish_glob_segment();
        let group_ix =
            self.capture_group_ids.pop().ok_or(ParseError::UnexpectedCaptureClose)?;
        self.result.capture_groups[group_ix].to = CapturePoint::ent_name(
            self.result.segments.len(),
            self.current_segment.ent_name.len(),
        );
        Ok(())
    }

    fn finish_glob_segment(&mut self) {
        if self.current_glob_segment.is_empty() {
            return;
        }
        self.current_segment.ent_name.push(mem::take(&mut self.current_glob_segment));
    }

    /// Recognize a leading `**/` (possibly opening a capture group) without
    /// consuming anything on failure.
    fn read_directory_wildcard(&mut self) -> Result<bool, ParseError> {
        let input = self.input;
        let mut open_capture = false;
        let mut close_capture = false;
        let mut ix = self.input_ix;
        if ix >= input.len() {
            return Ok(false);
        }
        if input[ix] == b'(' {
            open_capture = true;
            ix += 1;
        }
        if ix + 2 >= input.len() {
            return Ok(false);
        }
        if input[ix] != b'*' || input[ix + 1] != b'*' {
            return Ok(false);
        }
        ix += 2;
        if ix + 1 >= input.len() {
            return Ok(false);
        }
        if input[ix] == b')' {
            close_capture = true;
            ix += 1;
        }
        if ix >= input.len() {
            return Ok(false);
        }
        if input[ix] != b'/' {
            return Ok(false);
        }
        self.input_ix = ix + 1;
        if open_capture {
            let from = CapturePoint::wildcard(self.result.segments.len());
            self.open_capture_group(from);
        }
        if close_capture {
            return Err(ParseError::WildcardCaptureClose);
        }
        Ok(true)
    }

    fn open_capture_group(&mut self, from: CapturePoint) {
        self.result.capture_groups.push(CaptureGroup { from, to: CapturePoint::ent_name(0, 0) });
        self.capture_group_ids.push(self.result.capture_groups.len() - 1);
    }
}

/// Parse a pattern string, for example `src/(**/*).cpp`, into its pattern
/// object. This both validates the string (balanced capture parentheses,
/// well-formed wildcards, escapes) and precomputes the representation the
/// crawler matches against.
pub fn parse(pattern_string: &str) -> Result<Pattern, ParseError> {
    Parser::new(pattern_string).run()
}

/// A single result of a pattern search: which pattern matched, the matched
/// local path, and the captured groups as byte ranges into that path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMatch {
    pub pattern_ix: usize,
    pub local_path: String,
    pub captured_groups: Vec<(usize, usize)>,
}

/// A bookmark registers that some pattern has matched the enclosing
/// directory up to `segment_ix`. Capture offsets are one-based local-path
/// offsets; 0 means "not bound yet".
#[derive(Debug, Clone)]
struct Bookmark {
    pattern_ix: usize,
    segment_ix: usize,
    captured_from_ids: Vec<usize>,
    captured_to_ids: Vec<usize>,
}

/// Walks the tree under `root_path`, directory by directory, yielding files
/// matched by any of the patterns. Hidden entries (leading `.`) are skipped
/// entirely. The traversal order is deterministic: pending directories are
/// visited in lexicographic order of their path prefix.
pub struct Crawler<'a, R: DirectoryReader> {
    root_path: &'a str,
    patterns: &'a [Pattern],
    reader: R,
    pending_dirs: BTreeMap<String, Vec<Bookmark>>,
    path_prefix: String,
    bookmarks: Vec<Bookmark>,
    bookmark_ix: usize,
    ent: Option<DirEnt>,
    ent_kind: EntKind,
    ent_had_final_match: bool,
    dir_is_open: bool,
}

impl<'a, R: DirectoryReader> Crawler<'a, R> {
    pub fn new(root_path: &'a str, patterns: &'a [Pattern], reader: R) -> Crawler<'a, R> {
        let mut pending_dirs = BTreeMap::new();
        if !patterns.is_empty() {
            let initial_bookmarks = patterns
                .iter()
                .enumerate()
                .map(|(pattern_ix, pattern)| Bookmark {
                    pattern_ix,
                    segment_ix: 0,
                    captured_from_ids: vec![1; pattern.capture_groups.len()],
                    captured_to_ids: vec![1; pattern.capture_groups.len()],
                })
                .collect();
            pending_dirs.insert("/".to_string(), initial_bookmarks);
        }
        Crawler {
            root_path,
            patterns,
            reader,
            pending_dirs,
            path_prefix: String::new(),
            bookmarks: Vec::new(),
            bookmark_ix: 0,
            ent: None,
            ent_kind: EntKind::Unknown,
            ent_had_final_match: false,
            dir_is_open: false,
        }
    }

    pub fn next_match(&mut self) -> io::Result<Option<PathMatch>> {
        let patterns = self.patterns;
        while self.next_bookmark()? {
            let name = self.ent.as_ref().expect("crawler bookmark without an entry").name.clone();
            let bookmark = self.bookmarks[self.bookmark_ix].clone();
            let segments = &patterns[bookmark.pattern_ix].segments;
            let segment_ix = bookmark.segment_ix;
            if segments[segment_ix].has_wildcard && self.ent_kind(&name)? == EntKind::Directory {
                self.push_wildcard_match(&name, &bookmark);
            }
            let mut indices = Vec::new();
            if !glob::matches_with_indices(&segments[segment_ix].ent_name, &name, &mut indices) {
                continue;
            }
            if self.ent_kind(&name)? == EntKind::Directory && segment_ix + 1 < segments.len() {
                self.push_ent_name_match(&name, &bookmark, &indices);
            }
            if self.ent_had_final_match {
                continue;
            }
            if self.ent_kind(&name)? == EntKind::Regular && segment_ix == segments.len() - 1 {
                return Ok(Some(self.finalize_match(&name, &bookmark, &indices)));
            }
        }
        Ok(None)
    }

    /// The entry type, from the reader's cheap hint when it gave one, from a
    /// `lstat` call otherwise.
    fn ent_kind(&mut self, name: &str) -> io::Result<EntKind> {
        if self.ent_kind != EntKind::Unknown {
            return Ok(self.ent_kind);
        }
        self.ent_kind = EntKind::Unsupported;
        let ent_path = format!("{}{}{}", self.root_path, self.path_prefix, name);
        let metadata = fs::symlink_metadata(&ent_path)?;
        if metadata.is_dir() {
            self.ent_kind = EntKind::Directory;
        } else if metadata.is_file() {
            self.ent_kind = EntKind::Regular;
        }
        Ok(self.ent_kind)
    }

    fn push_wildcard_match(&mut self, name: &str, target: &Bookmark) {
        let dir_path = format!("{}{}/", self.path_prefix, name);
        self.pending_dirs.entry(dir_path).or_insert_with(Vec::new).push(Bookmark {
            pattern_ix: target.pattern_ix,
            segment_ix: target.segment_ix,
            captured_from_ids: target.captured_from_ids.clone(),
            captured_to_ids: target.captured_to_ids.clone(),
        });
    }

    fn push_ent_name_match(&mut self, name: &str, target: &Bookmark, match_indices: &[usize]) {
        let mut captured_from_ids = target.captured_from_ids.clone();
        let mut captured_to_ids = target.captured_to_ids.clone();
        self.update_captures_for_ent_name(
            target,
            match_indices,
            name.len(),
            &mut captured_from_ids,
            &mut captured_to_ids,
        );
        let dir_path = format!("{}{}/", self.path_prefix, name);
        self.pending_dirs.entry(dir_path).or_insert_with(Vec::new).push(Bookmark {
            pattern_ix: target.pattern_ix,
            segment_ix: target.segment_ix + 1,
            captured_from_ids,
            captured_to_ids,
        });
    }

    fn finalize_match(&mut self, name: &str, target: &Bookmark, match_indices: &[usize]) -> PathMatch {
        self.ent_had_final_match = true;
        let mut captured_from_ids = target.captured_from_ids.clone();
        let mut captured_to_ids = target.captured_to_ids.clone();
        self.update_captures_for_ent_name(
            target,
            match_indices,
            name.len(),
            &mut captured_from_ids,
            &mut captured_to_ids,
        );
        let local_path = format!("{}{}", &self.path_prefix[1..], name);
        let group_count = self.patterns[target.pattern_ix].capture_groups.len();
        PathMatch {
            pattern_ix: target.pattern_ix,
            local_path,
            captured_groups: (0..group_count)
                .map(|i| (captured_from_ids[i] - 1, captured_to_ids[i] - 1))
                .collect(),
        }
    }

    fn update_captures_for_ent_name(
        &self,
        target: &Bookmark,
        match_indices: &[usize],
        ent_name_size: usize,
        captured_from_ids: &mut [usize],
        captured_to_ids: &mut [usize],
    ) {
        let pattern = &self.patterns[target.pattern_ix];
        for (i, group) in pattern.capture_groups.iter().enumerate() {
            if group.from.is_ent_name(target.segment_ix) {
                let ent_name_ix = match_indices[group.from.ent_name_segment_ix];
                captured_from_ids[i] = self.path_prefix.len() + ent_name_ix;
            }
            if group.to.is_ent_name(target.segment_ix) {
                let ent_name_ix = if group.to.ent_name_segment_ix < match_indices.len() {
                    match_indices[group.to.ent_name_segment_ix]
                } else {
                    ent_name_size
                };
                captured_to_ids[i] = self.path_prefix.len() + ent_name_ix;
            }
            if group.from.is_wildcard(target.segment_ix + 1) {
                captured_from_ids[i] = self.path_prefix.len() + ent_name_size + 1;
            }
        }
    }

    fn next_bookmark(&mut self) -> io::Result<bool> {
        self.bookmark_ix += 1;
        if self.bookmark_ix < self.bookmarks.len() {
            return Ok(true);
        }
        self.bookmark_ix = 0;
        if !self.next_ent()? {
            return Ok(false);
        }
        while self.ent.as_ref().map_or(false, |ent| ent.name.starts_with('.')) {
            if !self.next_ent()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn next_ent(&mut self) -> io::Result<bool> {
        self.ent_had_final_match = false;
        if !self.dir_is_open {
            if !self.next_dir()? {
                return Ok(false);
            }
        }
        loop {
            match self.reader.next_ent()? {
                Some(ent) => {
                    self.ent_kind = ent.kind;
                    self.ent = Some(ent);
                    return Ok(true);
                }
                None => {
                    if !self.next_dir()? {
                        self.reader.close();
                        self.dir_is_open = false;
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn next_dir(&mut self) -> io::Result<bool> {
        let next_dir_path = match self.pending_dirs.keys().next() {
            None => return Ok(false),
            Some(path) => path.clone(),
        };
        let bookmarks =
            self.pending_dirs.remove(&next_dir_path).expect("pending directory disappeared");
        self.path_prefix = next_dir_path;
        self.bookmarks = bookmarks;
        self.reader.open(&format!("{}{}", self.root_path, self.path_prefix))?;
        self.dir_is_open = true;
        Ok(true)
    }
}
