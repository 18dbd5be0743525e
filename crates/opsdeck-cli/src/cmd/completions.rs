//! `deck completions`: shell completion scripts.

use std::io::{self, Write};

use anyhow::Result;
use clap::{Args, Command};
use clap_complete::{Shell, generate};

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,

    /// Name the script completes, for installs that alias `deck`.
    #[arg(long, default_value = "deck")]
    pub bin_name: String,
}

/// Write the completion script for `args.shell` to `out`.
pub fn write_completions(args: &CompletionsArgs, command: &mut Command, out: &mut dyn Write) {
    generate(args.shell, command, args.bin_name.as_str(), out);
}

/// # Errors
///
/// Returns an error if stdout cannot be flushed.
pub fn run_completions(args: &CompletionsArgs, command: &mut Command) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_completions(args, command, &mut out);
    out.flush()?;
    Ok(())
}
