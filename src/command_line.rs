//! Command line templates and their reification.
//!
//! A template is an alternance of literal and variable arguments, arranged
//! as "parts" that each carry a run of literals followed by a run of
//! variables. For example:
//!
//! ```text
//! clang++ -Wall -o a.out -L /usr/lib foo.o bar.o
//! ```
//!
//! is the parts `["-Wall", "-o"] + [output_file]` and
//! `["-L", "/usr/lib"] + [input_files]`. There is no way for a single
//! argument to mix literal and variable characters.

use std::collections::BTreeMap;
use std::fmt;

use serde_derive::Deserialize;

use crate::path::get_relative_path;

/// The placeholders a template may reference. `DependencyFile` expands to
/// the path of the FIFO the subprocess should write its depfile to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CommandLineTemplateVariable {
    #[serde(rename = "input_files")]
    InputFiles,
    #[serde(rename = "output_file")]
    OutputFiles,
    #[serde(rename = "dependency_file")]
    DependencyFile,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandLineTemplatePart {
    #[serde(rename = "literals", default)]
    pub literal_args: Vec<String>,
    #[serde(rename = "variables", default)]
    pub variable_args: Vec<CommandLineTemplateVariable>,
}

/// Environment entries are kept sorted so that template digests, and
/// therefore imprints, are stable across runs.
pub type Environment = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandLineTemplate {
    pub binary_path: String,
    #[serde(rename = "arguments", default)]
    pub parts: Vec<CommandLineTemplatePart>,
    #[serde(default)]
    pub environment: Environment,
}

/// A binary plus arguments, ready to be executed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    pub binary_path: String,
    pub args: Vec<String>,
    pub environment: Environment,
}

/// The contextual data substituted for the variables of a template.
#[derive(Debug, Clone, Default)]
pub struct CommandLineParameters {
    pub dependency_file: String,
    pub input_files: Vec<String>,
    pub output_files: Vec<String>,
}

fn insert_arg_paths(
    args: &mut Vec<String>,
    paths: &[String],
    root_path: &str,
    working_path: &str,
) {
    for path in paths {
        args.push(get_relative_path(working_path, path, root_path));
    }
}

/// Specialize a template for a particular set of files. Local paths are
/// resolved against `root_path` and spelled relatively to `working_path`,
/// so the command sees the same paths a user at the prompt would type.
pub fn reify_command_line(
    base: &CommandLineTemplate,
    parameters: &CommandLineParameters,
    root_path: &str,
    working_path: &str,
) -> CommandLine {
    let mut result = CommandLine {
        binary_path: base.binary_path.clone(),
        args: Vec::new(),
        environment: base.environment.clone(),
    };
    for part in &base.parts {
        for literal_arg in &part.literal_args {
            result.args.push(literal_arg.clone());
        }
        for variable_arg in &part.variable_args {
            match variable_arg {
                CommandLineTemplateVariable::InputFiles => {
                    insert_arg_paths(
                        &mut result.args,
                        &parameters.input_files,
                        root_path,
                        working_path,
                    );
                }
                CommandLineTemplateVariable::OutputFiles => {
                    insert_arg_paths(
                        &mut result.args,
                        &parameters.output_files,
                        root_path,
                        working_path,
                    );
                }
                CommandLineTemplateVariable::DependencyFile => {
                    result.args.push(parameters.dependency_file.clone());
                }
            }
        }
    }
    result
}

/// Escape an argument so it can be pasted into a shell. Not needed to run
/// a command line per se, only to render one for humans or scripts.
pub fn shell_escape(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '\0' => out.push_str("\\\\0"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\\\n"),
            '\r' => out.push_str("\\\\r"),
            ' ' => out.push_str("\\ "),
            c => out.push(c),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rendered = String::new();
        shell_escape(&mut rendered, &self.binary_path);
        for arg in &self.args {
            rendered.push(' ');
            shell_escape(&mut rendered, arg);
        }
        write!(f, "{}", rendered)
    }
}
