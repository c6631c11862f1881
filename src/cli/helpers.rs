//! Helper functions for CLI commands.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;

use crate::sandbox::FileEntry;

/// Parse a `NAME=PATH` argument and read the file it points to.
pub fn read_file_arg(arg: &str) -> Result<FileEntry> {
    let (name, path) = arg
        .split_once('=')
        .filter(|(name, path)| !name.is_empty() && !path.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Expected NAME=PATH, got '{}'", arg))?;
    let content = std::fs::read(path).with_context(|| format!("reading {}", path))?;
    Ok(FileEntry::new(name, content))
}

/// Read program input from a file, or from our own stdin for `-`.
pub fn read_stdin_arg(source: &Path) -> Result<Vec<u8>> {
    if source == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("reading stdin")?;
        Ok(buf)
    } else {
        std::fs::read(source).with_context(|| format!("reading {}", source.display()))
    }
}

/// Process exit status mirroring a program exit code; 124 like `timeout(1)`
/// when the program never finished.
pub fn exit_status(exit_code: Option<i64>) -> i32 {
    match exit_code {
        Some(code) => (code & 0xff) as i32,
        None => 124,
    }
}
