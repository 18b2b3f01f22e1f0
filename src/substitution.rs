//! Substitution patterns, the output side of update rules.
//!
//! A pattern string such as `dist/($1).o` is parsed into segments, each
//! either a literal run or a back-reference to a capture group of the input,
//! plus capture-group ranges expressed in *output* segments. Resolving a
//! pattern against a captured input string produces the concrete output path;
//! capturing inverts the operation so that downstream rules see the output as
//! a captured string of its own.

use crate::captured_string::CapturedString;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("escape character `\\` at the end of the pattern")]
    EscapeCharAtEnd,
    #[error("capture character `$` at the end of the pattern")]
    CaptureCharAtEnd,
    #[error("`$` must be followed by a capture group index in 1..9")]
    InvalidCaptureIndex,
    #[error("unexpected capture group closing parenthesis")]
    UnexpectedCaptureClose,
}

/// Referring to a capture group the input string does not have, for example
/// `$2` resolved against a single-group input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoSuchCaptureGroupError {
    pub index: usize,
}

impl std::fmt::Display for NoSuchCaptureGroupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pattern refers to non-existent capture group ${}", self.index + 1)
    }
}

impl std::error::Error for NoSuchCaptureGroupError {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    pub literal: String,
    pub captured_group_ix: Option<usize>,
}

impl Segment {
    fn clear(&mut self) {
        self.literal.clear();
        self.captured_group_ix = None;
    }

    fn is_empty(&self) -> bool {
        self.literal.is_empty() && self.captured_group_ix.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pattern {
    pub segments: Vec<Segment>,
    /// `(start_segment, end_segment)` ranges describing which output segments
    /// become the resolved string's capture groups.
    pub capture_groups: Vec<(usize, usize)>,
}

fn finish_segment(result: &mut Pattern, current: &mut Segment) {
    if current.is_empty() {
        return;
    }
    result.segments.push(current.clone());
    current.clear();
}

pub fn parse(input: &str) -> Result<Pattern, ParseError> {
    let mut result = Pattern::default();
    let mut current = Segment::default();
    let mut capture_group_ids: Vec<usize> = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => {
                finish_segment(&mut result, &mut current);
                capture_group_ids.push(result.capture_groups.len());
                result.capture_groups.push((result.segments.len(), 0));
            }
            b')' => {
                finish_segment(&mut result, &mut current);
                let group_ix =
                    capture_group_ids.pop().ok_or(ParseError::UnexpectedCaptureClose)?;
                result.capture_groups[group_ix].1 = result.segments.len();
            }
            b'$' => {
                finish_segment(&mut result, &mut current);
                i += 1;
                if i >= bytes.len() {
                    return Err(ParseError::CaptureCharAtEnd);
                }
                let c = bytes[i];
                if !(b'1'..=b'9').contains(&c) {
                    return Err(ParseError::InvalidCaptureIndex);
                }
                current.captured_group_ix = Some((c - b'1') as usize);
            }
            c => {
                let c = if c == b'\\' {
                    i += 1;
                    if i >= bytes.len() {
                        return Err(ParseError::EscapeCharAtEnd);
                    }
                    bytes[i]
                } else {
                    c
                };
                current.literal.push(c as char);
            }
        }
        i += 1;
    }
    finish_segment(&mut result, &mut current);
    Ok(result)
}

/// A pattern resolved against a particular captured string: the produced
/// value plus the start offset of each pattern segment within it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    pub value: String,
    pub segment_start_ids: Vec<usize>,
}

pub fn resolve(
    segments: &[Segment],
    input: &CapturedString,
) -> Result<Resolved, NoSuchCaptureGroupError> {
    let mut result = Resolved::default();
    result.segment_start_ids.reserve(segments.len());
    for segment in segments {
        result.segment_start_ids.push(result.value.len());
        if let Some(group_ix) = segment.captured_group_ix {
            let sub = input
                .sub_string(group_ix)
                .ok_or(NoSuchCaptureGroupError { index: group_ix })?;
            result.value.push_str(sub);
        }
        result.value.push_str(&segment.literal);
    }
    Ok(result)
}

/// Invert [`resolve`]: recover the capture groups of `resolved_string` from
/// the segment start offsets it was produced with. A group boundary at or
/// past the segment count designates the end of the string.
pub fn capture(
    capture_groups: &[(usize, usize)],
    resolved_string: &str,
    resolved_start_segment_ids: &[usize],
) -> CapturedString {
    let boundary = |segment_ix: usize| -> usize {
        resolved_start_segment_ids.get(segment_ix).copied().unwrap_or_else(|| resolved_string.len())
    };
    CapturedString {
        value: resolved_string.to_string(),
        captured_groups: capture_groups
            .iter()
            .map(|&(from, to)| (boundary(from), boundary(to)))
            .collect(),
    }
}
