//! Matching of a single file name against a glob pattern.
//!
//! A pattern is a sequence of segments, each an optional placeholder followed
//! by a literal. For example `foo_*.cpp` is the two segments
//! `{ none, "foo_" }` and `{ wildcard, ".cpp" }`. The matcher works directly
//! on this parsed form; parsing pattern strings is the business of the
//! `path_glob` module, which embeds name patterns in its path segments.

/// What a segment admits in front of its literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    None,
    /// `*`: any run of bytes, including the empty one.
    Wildcard,
    /// `?`: exactly one byte that is not a period.
    SingleWildcard,
}

impl Default for Placeholder {
    fn default() -> Self {
        Placeholder::None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    pub prefix: Placeholder,
    pub literal: String,
}

impl Segment {
    pub fn new(prefix: Placeholder, literal: &str) -> Segment {
        Segment { prefix, literal: literal.to_string() }
    }

    pub fn clear(&mut self) {
        self.prefix = Placeholder::None;
        self.literal.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.literal.is_empty() && self.prefix == Placeholder::None
    }
}

pub type Pattern = Vec<Segment>;

/// A glob pattern is matched only if we can find a sequence of segments that
/// matches, and if we reached the very end of the candidate doing so. If we
/// don't, we still have a chance to recover by restoring the state to the
/// last wildcard and trying again shifted by one byte.
///
/// Take for example the pattern `foo*bar` and the candidate `foobarglobar`.
/// At first we'd match `foobar`, but since it doesn't match the whole
/// candidate, it's not correct. In that case we go back, and we consider the
/// first `bar` as being matched by the wildcard instead of the literal.
struct Matcher<'a> {
    target: &'a [Segment],
    candidate: &'a [u8],
    indices: Option<&'a mut Vec<usize>>,
    segment_ix: usize,
    candidate_ix: usize,
    bookmark_ix: usize,
    last_wildcard_segment_ix: usize,
    has_bookmark: bool,
}

impl<'a> Matcher<'a> {
    fn new(target: &'a [Segment], candidate: &'a str, indices: Option<&'a mut Vec<usize>>) -> Self {
        let mut matcher = Matcher {
            target,
            candidate: candidate.as_bytes(),
            indices,
            segment_ix: 0,
            candidate_ix: 0,
            bookmark_ix: 0,
            last_wildcard_segment_ix: 0,
            has_bookmark: false,
        };
        if let Some(indices) = matcher.indices.as_mut() {
            indices.clear();
            indices.resize(target.len(), 0);
        }
        matcher
    }

    fn run(&mut self) -> bool {
        if !self.start_new_segment() {
            return false;
        }
        loop {
            let does_match = self.match_all_segments();
            let fully_matched = does_match && self.candidate_ix == self.candidate.len();
            if fully_matched {
                return true;
            }
            if !does_match || !self.restore_wildcard() {
                return false;
            }
        }
    }

    /// Try to match all of the remaining segments within the candidate. For
    /// each segment we match the placeholder then the literal; a failed
    /// literal may still be recovered by growing the last wildcard.
    fn match_all_segments(&mut self) -> bool {
        let target = self.target;
        loop {
            let mut does_match;
            loop {
                does_match = self.match_prefix()
                    && self.match_literal(target[self.segment_ix].literal.as_bytes());
                if does_match || !self.restore_wildcard() {
                    break;
                }
            }
            self.segment_ix += 1;
            if !does_match || !self.start_new_segment() {
                return does_match;
            }
        }
    }

    fn match_prefix(&mut self) -> bool {
        match self.target[self.segment_ix].prefix {
            Placeholder::None | Placeholder::Wildcard => true,
            Placeholder::SingleWildcard => self.match_single_wildcard(),
        }
    }

    fn start_new_segment(&mut self) -> bool {
        if self.segment_ix == self.target.len() {
            return false;
        }
        let candidate_ix = self.candidate_ix;
        if let Some(indices) = self.indices.as_mut() {
            indices[self.segment_ix] = candidate_ix;
        }
        if self.target[self.segment_ix].prefix == Placeholder::Wildcard {
            self.start_wildcard();
        }
        true
    }

    fn start_wildcard(&mut self) {
        self.bookmark_ix = self.candidate_ix;
        self.last_wildcard_segment_ix = self.segment_ix;
        self.has_bookmark = true;
    }

    fn match_single_wildcard(&mut self) -> bool {
        if self.candidate_ix == self.candidate.len() || self.candidate[self.candidate_ix] == b'.' {
            return false;
        }
        self.candidate_ix += 1;
        true
    }

    fn match_literal(&mut self, literal: &[u8]) -> bool {
        let mut literal_ix = 0;
        while self.candidate_ix < self.candidate.len()
            && literal_ix < literal.len()
            && self.candidate[self.candidate_ix] == literal[literal_ix]
        {
            self.candidate_ix += 1;
            literal_ix += 1;
        }
        literal_ix == literal.len()
    }

    /// Grow the last wildcard by one byte and retry from its segment. Fails
    /// once the wildcard can no longer leave room for the segment's literal.
    fn restore_wildcard(&mut self) -> bool {
        if !self.has_bookmark {
            return false;
        }
        self.bookmark_ix += 1;
        self.candidate_ix = self.bookmark_ix;
        self.segment_ix = self.last_wildcard_segment_ix;
        self.candidate_ix + self.target[self.segment_ix].literal.len() <= self.candidate.len()
    }
}

pub fn matches(target: &[Segment], candidate: &str) -> bool {
    Matcher::new(target, candidate, None).run()
}

/// Like [`matches`], but on success `indices` additionally holds, for each
/// segment, the index at which it started matching within the candidate.
/// For example `foo*.cpp` has two segments, `foo` and `*.cpp`; matched
/// against `foobar.cpp` the indices are `[0, 3]`.
pub fn matches_with_indices(
    target: &[Segment],
    candidate: &str,
    indices: &mut Vec<usize>,
) -> bool {
    Matcher::new(target, candidate, Some(indices)).run()
}
