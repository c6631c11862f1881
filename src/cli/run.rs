//! Run command - one sandboxed execution.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::helpers::{exit_status, read_file_arg, read_stdin_arg};
use crate::config;
use crate::logging;
use crate::sandbox::{CreateOptions, Limits, RunResult, SandboxError, SandboxManager};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Profile name from the config.
    pub profile: String,

    /// Shell command; the profile's command when omitted.
    #[arg(short = 'c', long)]
    pub command: Option<String>,

    /// Program input: a file path, or `-` for our own stdin.
    #[arg(long)]
    pub stdin: Option<PathBuf>,

    /// CPU time limit in seconds.
    #[arg(long)]
    pub cputime: Option<u64>,

    /// Wall-clock limit in seconds (default: cputime × factor).
    #[arg(long)]
    pub realtime: Option<u64>,

    /// Memory limit in MB.
    #[arg(long)]
    pub memory: Option<u64>,

    /// Process limit; negative for unlimited.
    #[arg(long, allow_negative_numbers = true)]
    pub processes: Option<i64>,

    /// File size limit in KB.
    #[arg(long)]
    pub file_size: Option<u64>,

    /// File to place in the working directory, as NAME=PATH. Repeatable.
    #[arg(long = "file", value_name = "NAME=PATH")]
    pub files: Vec<String>,

    /// Print the result as JSON.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    fn limits(&self) -> Limits {
        Limits {
            cputime: self.cputime,
            realtime: self.realtime,
            memory: self.memory,
            processes: self.processes,
            file_size: self.file_size,
        }
    }
}

/// JSON rendering of a result with output decoded as lossy UTF-8.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReport<'a> {
    profile: &'a str,
    exit_code: Option<i64>,
    stdout: String,
    stderr: String,
    duration: f64,
    timeout: bool,
    oom_killed: bool,
}

impl<'a> RunReport<'a> {
    fn new(profile: &'a str, result: &RunResult) -> Self {
        Self {
            profile,
            exit_code: result.exit_code,
            stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            duration: result.duration,
            timeout: result.timeout,
            oom_killed: result.oom_killed,
        }
    }
}

pub async fn cmd_run(config_path: Option<&Path>, args: RunArgs) -> Result<()> {
    let cfg = config::load_config(config_path)?;
    logging::init_logging(&cfg)?;

    let stdin = args
        .stdin
        .as_deref()
        .map(read_stdin_arg)
        .transpose()?;
    let files = args
        .files
        .iter()
        .map(|f| read_file_arg(f))
        .collect::<Result<Vec<_>>>()?;

    let options = CreateOptions {
        command: args.command.clone(),
        limits: Some(args.limits()),
        files,
        workdir: None,
    };

    let manager = SandboxManager::from_config(Arc::new(cfg))?;
    info!(profile = %args.profile, "Running sandbox");

    let result = match manager.run(&args.profile, options, stdin.as_deref()).await {
        Ok(result) => result,
        Err(e) if args.json => {
            let report = e.to_error_report(None, None);
            println!("{}", report.to_json()?);
            std::process::exit(exit_code_for(&e));
        }
        Err(e) => return Err(e).context(format!("running profile '{}'", args.profile)),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&RunReport::new(&args.profile, &result))?);
    } else {
        use std::io::Write;
        let mut out = std::io::stdout();
        out.write_all(&result.stdout)?;
        out.flush()?;
        let mut err = std::io::stderr();
        err.write_all(&result.stderr)?;
        if result.timeout {
            writeln!(err, "[dockjail] time limit exceeded")?;
        }
        if result.oom_killed {
            writeln!(err, "[dockjail] memory limit exceeded")?;
        }
        err.flush()?;
    }

    std::process::exit(exit_status(result.exit_code));
}

/// Exit status for failures that produced no program result.
fn exit_code_for(e: &SandboxError) -> i32 {
    match e {
        SandboxError::InvalidArgument(_) => 2,
        _ => 1,
    }
}
