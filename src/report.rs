//! Plan-derived reporting: DOT graphs and standalone shell scripts.
//!
//! Both modes drain an update plan in dependency order instead of running
//! it, so what they print is exactly what an update would do.

use std::io::{self, Write};

use itertools::Itertools;

use crate::command_line::{
    reify_command_line, shell_escape, CommandLineParameters, CommandLineTemplate,
};
use crate::path::dirname;
use crate::update_map::UpdateMap;
use crate::update_plan::UpdatePlan;

/// Write a DOT-formatted graph of the planned output files, one edge per
/// (input, output) pair, labeled with the generating binary.
pub fn output_dot_graph<W: Write>(
    out: &mut W,
    updm: &UpdateMap,
    plan: &mut UpdatePlan,
    command_line_templates: &[CommandLineTemplate],
) -> io::Result<()> {
    writeln!(out, "# generated with `upd --dot-graph`")?;
    writeln!(out, "digraph upd {{")?;
    writeln!(out, "  rankdir=\"LR\";")?;
    while let Some(local_target_path) = plan.queued_output_file_paths.pop_front() {
        let descriptor = &updm.output_files_by_path[&local_target_path];
        let template = &command_line_templates[descriptor.command_line_ix];
        for input_path in descriptor
            .local_input_file_paths
            .iter()
            .chain(descriptor.order_only_dependency_file_paths.iter())
            .sorted()
        {
            writeln!(
                out,
                "  \"{}\" -> \"{}\" [label=\"{}\"];",
                input_path, local_target_path, template.binary_path
            )?;
        }
        plan.erase(&local_target_path);
    }
    writeln!(out, "}}")
}

/// Write a `bash` script reproducing the whole planned update, in
/// topological order. Output directories get `mkdir -p` lines; depfile
/// variables are pointed at `/dev/null` since the script cannot consume
/// dynamic dependencies anyway.
pub fn output_shell_script<W: Write>(
    out: &mut W,
    updm: &UpdateMap,
    plan: &mut UpdatePlan,
    command_line_templates: &[CommandLineTemplate],
) -> io::Result<()> {
    let mut mked_dir_paths: std::collections::HashSet<String> = std::collections::HashSet::new();
    writeln!(out, "#!/bin/bash")?;
    writeln!(out, "# generated with `upd --shell-script`")?;
    writeln!(out, "set -ev")?;
    writeln!(out)?;
    while let Some(local_target_path) = plan.queued_output_file_paths.pop_front() {
        let descriptor = &updm.output_files_by_path[&local_target_path];
        let template = &command_line_templates[descriptor.command_line_ix];
        let local_dir = dirname(&local_target_path);
        if local_dir != "." && !mked_dir_paths.contains(&local_dir) {
            let mut escaped = String::new();
            shell_escape(&mut escaped, &local_dir);
            writeln!(out, "mkdir -p {}", escaped)?;
            mked_dir_paths.insert(local_dir);
        }
        // Reifying against `.` as both root and working directory keeps all
        // the local paths spelled as-is.
        let command_line = reify_command_line(
            template,
            &CommandLineParameters {
                dependency_file: "/dev/null".to_string(),
                input_files: descriptor.local_input_file_paths.clone(),
                output_files: vec![local_target_path.clone()],
            },
            ".",
            ".",
        );
        writeln!(out, "{}", command_line)?;
        plan.erase(&local_target_path);
    }
    Ok(())
}
