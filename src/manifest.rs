//! The typed manifest and its `updfile.json` reader.
//!
//! The manifest enumerates command line templates, source file patterns, and
//! update rules. Pattern strings are parsed into their structured form right
//! at deserialization time so that the rest of the engine never sees raw
//! pattern syntax.

use std::convert::TryFrom;
use std::fs;
use std::io;

use serde::de;
use serde::Deserializer;
use serde_derive::Deserialize;
use thiserror::Error;

use crate::command_line::CommandLineTemplate;
use crate::io::UPDFILE_NAME;
use crate::path_glob;
use crate::substitution;

/// What an update rule consumes: either the matches of a source pattern, or
/// the outputs of an earlier rule. Rules can only refer to rules declared
/// before them, which statically rules out dependency cycles; the check
/// itself happens when the update map is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawUpdateRuleInput")]
pub enum UpdateRuleInput {
    Source(usize),
    Rule(usize),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawUpdateRuleInput {
    source_ix: Option<usize>,
    rule_ix: Option<usize>,
}

impl TryFrom<RawUpdateRuleInput> for UpdateRuleInput {
    type Error = String;

    fn try_from(raw: RawUpdateRuleInput) -> Result<UpdateRuleInput, String> {
        match (raw.source_ix, raw.rule_ix) {
            (Some(ix), None) => Ok(UpdateRuleInput::Source(ix)),
            (None, Some(ix)) => Ok(UpdateRuleInput::Rule(ix)),
            (None, None) => Err("rule input needs either `source_ix` or `rule_ix`".to_string()),
            (Some(_), Some(_)) => {
                Err("rule input cannot have both `source_ix` and `rule_ix`".to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateRule {
    pub command_line_ix: usize,
    pub inputs: Vec<UpdateRuleInput>,
    /// Paths whose content participates in the imprint of the outputs but
    /// that do not feed the output substitution pattern. `dependencies` is
    /// the legacy spelling; specifying both is an error.
    #[serde(
        rename = "order_only_dependencies",
        alias = "dependencies",
        default
    )]
    pub order_only_dependencies: Vec<UpdateRuleInput>,
    #[serde(deserialize_with = "deserialize_substitution_pattern")]
    pub output: substitution::Pattern,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub command_line_templates: Vec<CommandLineTemplate>,
    #[serde(default, deserialize_with = "deserialize_source_patterns")]
    pub source_patterns: Vec<path_glob::Pattern>,
    #[serde(default)]
    pub rules: Vec<UpdateRule>,
}

fn deserialize_source_patterns<'de, D>(
    deserializer: D,
) -> Result<Vec<path_glob::Pattern>, D::Error>
where
    D: Deserializer<'de>,
{
    let pattern_strings: Vec<String> = serde::Deserialize::deserialize(deserializer)?;
    pattern_strings
        .iter()
        .map(|pattern_string| {
            path_glob::parse(pattern_string).map_err(|error| {
                de::Error::custom(format_args!(
                    "invalid source pattern `{}`: {}",
                    pattern_string, error
                ))
            })
        })
        .collect()
}

fn deserialize_substitution_pattern<'de, D>(
    deserializer: D,
) -> Result<substitution::Pattern, D::Error>
where
    D: Deserializer<'de>,
{
    let pattern_string: String = serde::Deserialize::deserialize(deserializer)?;
    substitution::parse(&pattern_string).map_err(|error| {
        de::Error::custom(format_args!(
            "invalid output pattern `{}`: {}",
            pattern_string, error
        ))
    })
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("cannot find `{}' in the root directory", UPDFILE_NAME)]
    Missing,
    #[error("failed to read `{}': {source}", UPDFILE_NAME)]
    Io {
        #[from]
        source: io::Error,
    },
    #[error("invalid manifest, line {line}, column {column}: {message}")]
    Parse { line: usize, column: usize, message: String },
}

/// Read and parse `<root>/updfile.json`.
pub fn read_from_file(root_path: &str) -> Result<Manifest, ManifestError> {
    let manifest_path = format!("{}/{}", root_path, UPDFILE_NAME);
    let content = match fs::read_to_string(&manifest_path) {
        Ok(content) => content,
        Err(ref error) if error.kind() == io::ErrorKind::NotFound => {
            return Err(ManifestError::Missing);
        }
        Err(error) => return Err(error.into()),
    };
    serde_json::from_str(&content).map_err(|error| ManifestError::Parse {
        line: error.line(),
        column: error.column(),
        message: error.to_string(),
    })
}
