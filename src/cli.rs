//! Command line option parsing for the `upd` binary.

use std::fmt;

use thiserror::Error;

/// The basic operation the program should perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    DotGraph,
    Help,
    Init,
    Root,
    ShellScript,
    Update,
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Always,
    Auto,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub action: Action,
    pub color_diagnostics: ColorMode,
    pub concurrency: usize,
    pub print_commands: bool,
    pub relative_target_paths: Vec<String>,
    pub update_all_files: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            action: Action::Update,
            color_diagnostics: ColorMode::Auto,
            concurrency: 0,
            print_commands: false,
            relative_target_paths: Vec::new(),
            update_all_files: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CliError {
    #[error("invalid argument: `{0}`")]
    UnexpectedArgument(String),
    #[error("options `{0}` and `{1}` are in conflict")]
    IncompatibleOptions(String, String),
    #[error("`{0}` is not a valid color mode")]
    InvalidColorMode(String),
    #[error("`{0}` is not a valid concurrency")]
    InvalidConcurrency(String),
    #[error("option `{0}` requires an argument")]
    OptionRequiresArgument(String),
}

fn parse_color_mode(value: &str) -> Result<ColorMode, CliError> {
    match value {
        "auto" => Ok(ColorMode::Auto),
        "never" => Ok(ColorMode::Never),
        "always" => Ok(ColorMode::Always),
        _ => Err(CliError::InvalidColorMode(value.to_string())),
    }
}

/// `auto` means "pick a default from the CPU count", represented as 0.
fn parse_concurrency(value: &str) -> Result<usize, CliError> {
    if value == "auto" {
        return Ok(0);
    }
    match value.parse::<usize>() {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(CliError::InvalidConcurrency(value.to_string())),
    }
}

struct ActionArg {
    action_arg: Option<String>,
}

impl ActionArg {
    fn setup(
        &mut self,
        options: &mut Options,
        arg: &str,
        new_action: Action,
    ) -> Result<(), CliError> {
        if let Some(ref existing) = self.action_arg {
            return Err(CliError::IncompatibleOptions(existing.clone(), arg.to_string()));
        }
        self.action_arg = Some(arg.to_string());
        options.action = new_action;
        Ok(())
    }
}

/// Parse the process arguments (without the program name).
pub fn parse_options<S: AsRef<str>>(args: &[S]) -> Result<Options, CliError> {
    let mut options = Options::default();
    let mut action_arg = ActionArg { action_arg: None };
    let mut reading_options = true;
    let mut args = args.iter();
    while let Some(arg) = args.next() {
        let arg = arg.as_ref();
        if !(reading_options && arg.starts_with('-')) {
            options.relative_target_paths.push(arg.to_string());
            continue;
        }
        if !arg.starts_with("--") {
            return Err(CliError::UnexpectedArgument(arg.to_string()));
        }
        match arg {
            "--root" => action_arg.setup(&mut options, arg, Action::Root)?,
            "--version" => action_arg.setup(&mut options, arg, Action::Version)?,
            "--help" => action_arg.setup(&mut options, arg, Action::Help)?,
            "--init" => action_arg.setup(&mut options, arg, Action::Init)?,
            "--dot-graph" => action_arg.setup(&mut options, arg, Action::DotGraph)?,
            "--shell-script" => action_arg.setup(&mut options, arg, Action::ShellScript)?,
            "--all" => options.update_all_files = true,
            "--print-commands" => options.print_commands = true,
            "--color-diagnostics" => {
                let value = args
                    .next()
                    .ok_or_else(|| CliError::OptionRequiresArgument(arg.to_string()))?;
                options.color_diagnostics = parse_color_mode(value.as_ref())?;
            }
            "--concurrency" => {
                let value = args
                    .next()
                    .ok_or_else(|| CliError::OptionRequiresArgument(arg.to_string()))?;
                options.concurrency = parse_concurrency(value.as_ref())?;
            }
            "--" => reading_options = false,
            _ => return Err(CliError::UnexpectedArgument(arg.to_string())),
        }
    }
    Ok(options)
}

pub fn print_help() {
    println!(
        r#"Usage: upd [options] [targets]
Update files according to a manifest.

Operations:
  --help          output usage help
  --root          output the root directory path
  --version       output the semantic version number
  --init          create a root marker at the current working path
  --dot-graph     output a DOT-formatted graph of the output files
  --shell-script  output a `bash' shell script meant to update all
                  the specified output files

Updates:
  --all     include all the known files in the update, or graph
  --print-commands
      print each command on the output before it is executed
  --concurrency {{auto|<number>}}
      specify how many update processes can run in parallel, at maximum

General:
  --color-diagnostics {{auto|always|never}}
      use ANSI color escape codes on stderr; `auto` means colors are
      output if stderr is a TTY, and is the default"#
    );
}

/// Write an ANSI SGR escape if colors are enabled.
pub fn ansi_sgr<W: fmt::Write>(out: &mut W, sgr_code: u32, use_color: bool) -> fmt::Result {
    if !use_color {
        return Ok(());
    }
    write!(out, "\x1b[{}m", sgr_code)
}

/// The `upd: fatal: ` diagnostic prefix, colorized when enabled.
pub fn fatal_error_prefix(use_color: bool) -> String {
    let mut prefix = String::new();
    prefix.push_str("upd: ");
    let _ = ansi_sgr(&mut prefix, 31, use_color);
    prefix.push_str("fatal:");
    let _ = ansi_sgr(&mut prefix, 0, use_color);
    prefix.push(' ');
    prefix
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> Result<Options, CliError> {
        parse_options(args)
    }

    #[test]
    fn parses_defaults() {
        let options = parse(&[]).unwrap();
        assert_eq!(options, Options::default());
    }

    #[test]
    fn parses_targets_and_flags() {
        let options =
            parse(&["--print-commands", "dist/a.o", "--concurrency", "4", "dist/b.o"]).unwrap();
        assert_eq!(options.action, Action::Update);
        assert!(options.print_commands);
        assert_eq!(options.concurrency, 4);
        assert_eq!(options.relative_target_paths, vec!["dist/a.o", "dist/b.o"]);
    }

    #[test]
    fn parses_actions_and_rejects_conflicts() {
        assert_eq!(parse(&["--root"]).unwrap().action, Action::Root);
        assert_eq!(parse(&["--dot-graph"]).unwrap().action, Action::DotGraph);
        assert_eq!(
            parse(&["--root", "--version"]),
            Err(CliError::IncompatibleOptions("--root".to_string(), "--version".to_string()))
        );
    }

    #[test]
    fn rejects_unknown_and_short_options() {
        assert_eq!(
            parse(&["--frobnicate"]),
            Err(CliError::UnexpectedArgument("--frobnicate".to_string()))
        );
        assert_eq!(parse(&["-x"]), Err(CliError::UnexpectedArgument("-x".to_string())));
    }

    #[test]
    fn double_dash_stops_option_parsing() {
        let options = parse(&["--", "--all"]).unwrap();
        assert!(!options.update_all_files);
        assert_eq!(options.relative_target_paths, vec!["--all"]);
    }

    #[test]
    fn parses_option_arguments() {
        assert_eq!(
            parse(&["--color-diagnostics", "never"]).unwrap().color_diagnostics,
            ColorMode::Never
        );
        assert_eq!(
            parse(&["--color-diagnostics"]),
            Err(CliError::OptionRequiresArgument("--color-diagnostics".to_string()))
        );
        assert_eq!(
            parse(&["--color-diagnostics", "sometimes"]),
            Err(CliError::InvalidColorMode("sometimes".to_string()))
        );
        assert_eq!(parse(&["--concurrency", "auto"]).unwrap().concurrency, 0);
        assert_eq!(
            parse(&["--concurrency", "0"]),
            Err(CliError::InvalidConcurrency("0".to_string()))
        );
    }
}
