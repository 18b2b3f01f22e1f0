//! The `upd` binary: parse options, run, map failures to diagnostics.

use std::env;

use upd::cli::{self, Action, ColorMode};

fn main() {
    std::process::exit(main_inner());
}

fn main_inner() -> i32 {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let options = match cli::parse_options(&args) {
        Ok(options) => options,
        Err(error) => {
            eprintln!("upd: fatal: {}", error);
            return 1;
        }
    };

    let use_color = match options.color_diagnostics {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => nix::unistd::isatty(2).unwrap_or(false),
    };
    let fatal = |message: String| {
        eprintln!("{}{}", cli::fatal_error_prefix(use_color), message);
    };

    let accepts_targets = matches!(
        options.action,
        Action::Update | Action::DotGraph | Action::ShellScript
    );
    if !accepts_targets {
        if !options.relative_target_paths.is_empty() {
            fatal("this operation doesn't accept target arguments".to_string());
            return 2;
        }
        if options.update_all_files {
            fatal("this operation doesn't accept `--all`".to_string());
            return 2;
        }
    }
    if options.update_all_files && !options.relative_target_paths.is_empty() {
        fatal("cannot have both explicit targets and `--all`".to_string());
        return 2;
    }

    match upd::cmd::run(&options) {
        Ok(()) => 0,
        Err(error) => {
            fatal(error.to_string());
            2
        }
    }
}
