//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

use crate::launcher::DEFAULT_STACK_SIZE;

/// Load and run an ELF64 binary in user space.
#[derive(Parser, Debug)]
#[command(name = "elfexec", version, about)]
pub struct Cli {
    /// Program to load
    pub program: PathBuf,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Extra environment entry (KEY=VALUE); repeatable
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Start from an empty environment instead of inheriting this one
    #[arg(long)]
    pub no_inherit_env: bool,

    /// Stack size for the program, in bytes
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_STACK_SIZE)]
    pub stack_size: usize,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Environment for the child: the inherited environment (unless
    /// disabled) with `--env` entries appended, later entries shadowing
    /// earlier ones with the same key.
    pub fn build_environment(&self) -> Vec<String> {
        let mut envs: Vec<String> = if self.no_inherit_env {
            Vec::new()
        } else {
            std::env::vars().map(|(k, v)| format!("{k}={v}")).collect()
        };
        for entry in &self.env {
            let key = entry.split('=').next().unwrap_or(entry);
            envs.retain(|e| e.split('=').next() != Some(key));
            envs.push(entry.clone());
        }
        envs
    }

    /// argv for the child: the program path, then the trailing arguments.
    pub fn build_argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.display().to_string());
        argv.extend(self.args.iter().cloned());
        argv
    }
}
