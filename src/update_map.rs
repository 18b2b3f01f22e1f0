//! Expansion of the manifest into the update map.
//!
//! The update map associates every local output path with the description of
//! how to generate it: which command line template, which concrete input
//! files, which order-only dependencies. It is built once per run by
//! crawling the source patterns and replaying each rule, in declaration
//! order, over the captured matches of its inputs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;

use log::debug;
use thiserror::Error;

use crate::captured_string::CapturedString;
use crate::io::FsDirectoryReader;
use crate::manifest::{Manifest, UpdateRuleInput};
use crate::path_glob;
use crate::substitution;

/// Everything needed to generate one output file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputFile {
    pub command_line_ix: usize,
    pub local_input_file_paths: Vec<String>,
    /// Sorted so that iteration order, and therefore imprint computation,
    /// is deterministic.
    pub order_only_dependency_file_paths: BTreeSet<String>,
}

pub type OutputFilesByPath = HashMap<String, OutputFile>;

#[derive(Debug, Default)]
pub struct UpdateMap {
    pub output_files_by_path: OutputFilesByPath,
}

#[derive(Debug, Error)]
pub enum UpdateMapError {
    #[error("rule #{rule_ix} refers to a rule declared at or after itself")]
    CannotReferToLaterRule { rule_ix: usize },
    #[error("rule #{rule_ix} refers to non-existent input #{input_ix}")]
    InputIndexOutOfRange { rule_ix: usize, input_ix: usize },
    #[error("rule #{rule_ix} refers to non-existent command line template #{command_line_ix}")]
    CommandLineIndexOutOfRange { rule_ix: usize, command_line_ix: usize },
    #[error("the source pattern #{0} matched no files on the filesystem")]
    NoSourceMatches(usize),
    #[error(
        "the output file `{local_output_file_path}' is generated by the two conflicting rules \
         #{first_rule_ix} and #{second_rule_ix}"
    )]
    DuplicateOutput { local_output_file_path: String, first_rule_ix: usize, second_rule_ix: usize },
    #[error(transparent)]
    Substitution(#[from] substitution::NoSuchCaptureGroupError),
    #[error("failed to crawl the source tree")]
    Crawl(#[from] io::Error),
}

/// Crawl the filesystem for all the source patterns at once. Every pattern
/// must match at least one file; matches are sorted per pattern.
pub fn crawl_source_patterns(
    root_path: &str,
    patterns: &[path_glob::Pattern],
) -> Result<Vec<Vec<CapturedString>>, UpdateMapError> {
    let mut matches: Vec<Vec<CapturedString>> = vec![Vec::new(); patterns.len()];
    let mut crawler = path_glob::Crawler::new(root_path, patterns, FsDirectoryReader::new());
    while let Some(path_match) = crawler.next_match()? {
        matches[path_match.pattern_ix].push(CapturedString {
            value: path_match.local_path,
            captured_groups: path_match.captured_groups,
        });
    }
    for (pattern_ix, file_matches) in matches.iter_mut().enumerate() {
        if file_matches.is_empty() {
            return Err(UpdateMapError::NoSourceMatches(pattern_ix));
        }
        file_matches.sort();
    }
    debug!(
        "crawled {} source pattern(s), {} file(s) total",
        patterns.len(),
        matches.iter().map(Vec::len).sum::<usize>()
    );
    Ok(matches)
}

fn captures_for_input<'a>(
    rule_ix: usize,
    input: UpdateRuleInput,
    source_matches: &'a [Vec<CapturedString>],
    rule_captured_paths: &'a [Vec<CapturedString>],
) -> Result<&'a [CapturedString], UpdateMapError> {
    let (captures, input_ix) = match input {
        UpdateRuleInput::Source(input_ix) => (source_matches.get(input_ix), input_ix),
        UpdateRuleInput::Rule(input_ix) => {
            if input_ix >= rule_ix {
                return Err(UpdateMapError::CannotReferToLaterRule { rule_ix });
            }
            (rule_captured_paths.get(input_ix), input_ix)
        }
    };
    captures
        .map(Vec::as_slice)
        .ok_or(UpdateMapError::InputIndexOutOfRange { rule_ix, input_ix })
}

/// Build the update map for a manifest. Fails on forward rule references,
/// on source patterns that match nothing, and on two rules producing the
/// same output path.
pub fn gen_update_map(root_path: &str, manifest: &Manifest) -> Result<UpdateMap, UpdateMapError> {
    let mut result = UpdateMap::default();
    let source_matches = crawl_source_patterns(root_path, &manifest.source_patterns)?;
    let mut rule_captured_paths: Vec<Vec<CapturedString>> =
        vec![Vec::new(); manifest.rules.len()];
    let mut rule_ids_by_output_path: HashMap<String, usize> = HashMap::new();

    for (rule_ix, rule) in manifest.rules.iter().enumerate() {
        if rule.command_line_ix >= manifest.command_line_templates.len() {
            return Err(UpdateMapError::CommandLineIndexOutOfRange {
                rule_ix,
                command_line_ix: rule.command_line_ix,
            });
        }

        // For each distinct output path, the input paths that produce it and
        // the segment offsets of the last resolution. Sorted so that output
        // declaration order is deterministic.
        let mut data_by_path: BTreeMap<String, (Vec<String>, Vec<usize>)> = BTreeMap::new();
        for &input in &rule.inputs {
            let input_captures =
                captures_for_input(rule_ix, input, &source_matches, &rule_captured_paths)?;
            for input_capture in input_captures {
                let local_output = substitution::resolve(&rule.output.segments, input_capture)?;
                let datum = data_by_path.entry(local_output.value).or_default();
                datum.0.push(input_capture.value.clone());
                datum.1 = local_output.segment_start_ids;
            }
        }

        let mut all_dependencies: BTreeSet<String> = BTreeSet::new();
        for &dependency in &rule.order_only_dependencies {
            let dependency_captures =
                captures_for_input(rule_ix, dependency, &source_matches, &rule_captured_paths)?;
            for dependency_capture in dependency_captures {
                all_dependencies.insert(dependency_capture.value.clone());
            }
        }

        let mut captured_paths = Vec::with_capacity(data_by_path.len());
        for (local_output_path, (local_input_file_paths, segment_start_ids)) in data_by_path {
            if result.output_files_by_path.contains_key(&local_output_path) {
                return Err(UpdateMapError::DuplicateOutput {
                    first_rule_ix: rule_ids_by_output_path[&local_output_path],
                    second_rule_ix: rule_ix,
                    local_output_file_path: local_output_path,
                });
            }
            captured_paths.push(substitution::capture(
                &rule.output.capture_groups,
                &local_output_path,
                &segment_start_ids,
            ));
            result.output_files_by_path.insert(
                local_output_path.clone(),
                OutputFile {
                    command_line_ix: rule.command_line_ix,
                    local_input_file_paths,
                    order_only_dependency_file_paths: all_dependencies.clone(),
                },
            );
            rule_ids_by_output_path.insert(local_output_path, rule_ix);
        }
        rule_captured_paths[rule_ix] = captured_paths;
    }
    debug!("update map has {} output file(s)", result.output_files_by_path.len());
    Ok(result)
}
