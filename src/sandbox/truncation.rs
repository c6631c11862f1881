// Output truncation for returned and logged results
//
// Captured output is cut to a fixed number of bytes from the start, followed
// by TRUNCATION_MARKER. Only the copy handed back is shortened; nothing
// inside the container is touched.

use super::types::RunResult;

/// Suffix appended to truncated output.
pub const TRUNCATION_MARKER: &[u8] = b" *** truncated ***";

/// Output cap used when results are written to logs.
pub const LOG_OUTPUT_CAP: usize = 100;

/// Keep at most `max_size` bytes of `content`, appending the marker when
/// anything was cut.
pub fn truncate_bytes(mut content: Vec<u8>, max_size: usize) -> Vec<u8> {
    if content.len() <= max_size {
        return content;
    }
    content.truncate(max_size);
    content.extend_from_slice(TRUNCATION_MARKER);
    content
}

/// Apply [`truncate_bytes`] to stdout and stderr of a result.
pub fn truncate_result(result: RunResult, max_size: usize) -> RunResult {
    RunResult {
        stdout: truncate_bytes(result.stdout, max_size),
        stderr: truncate_bytes(result.stderr, max_size),
        ..result
    }
}

/// Lossy, log-sized rendering of captured output.
pub fn preview(content: &[u8]) -> String {
    String::from_utf8_lossy(&truncate_bytes(content.to_vec(), LOG_OUTPUT_CAP)).into_owned()
}
