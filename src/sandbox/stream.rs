// Attach stream codec - splits the engine's multiplexed output
//
// Without a TTY the engine interleaves stdout and stderr on one socket as
// frames of an 8-byte header followed by a payload:
//
//   [stream id: u8][0, 0, 0][payload length: u32 big-endian][payload ...]
//
// Stream id 1 is stdout, 2 is stderr. Payloads of any other stream are
// dropped.

/// Size of a frame header in bytes.
pub const HEADER_LEN: usize = 8;

const STDOUT: u8 = 1;
const STDERR: u8 = 2;

/// Split a raw attach stream buffer into `(stdout, stderr)`.
///
/// Decoding stops when fewer than [`HEADER_LEN`] bytes remain. A payload cut
/// short by the end of the buffer contributes the bytes that are present.
pub fn demultiplex(data: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut walker = 0;

    while data.len() - walker >= HEADER_LEN {
        let header = &data[walker..walker + HEADER_LEN];
        let stream = header[0];
        let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let start = walker + HEADER_LEN;
        let end = start.saturating_add(length).min(data.len());
        walker = end;

        match stream {
            STDOUT => stdout.extend_from_slice(&data[start..end]),
            STDERR => stderr.extend_from_slice(&data[start..end]),
            _ => {}
        }
    }

    (stdout, stderr)
}

#[derive(Debug, Clone, Copy)]
enum State {
    Header { filled: usize },
    Payload { stream: u8, remaining: usize },
}

/// Incremental form of [`demultiplex`] fed with arbitrary read chunks.
///
/// `FrameDecoder` gives the same output as [`demultiplex`] on the
/// concatenation of all chunks, wherever the chunk boundaries fall.
#[derive(Debug)]
pub struct FrameDecoder {
    header: [u8; HEADER_LEN],
    state: State,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            header: [0; HEADER_LEN],
            state: State::Header { filled: 0 },
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    /// Feed the next chunk read from the socket.
    pub fn push(&mut self, mut input: &[u8]) {
        while !input.is_empty() {
            match self.state {
                State::Header { filled } => {
                    let take = (HEADER_LEN - filled).min(input.len());
                    self.header[filled..filled + take].copy_from_slice(&input[..take]);
                    input = &input[take..];

                    if filled + take < HEADER_LEN {
                        self.state = State::Header { filled: filled + take };
                    } else {
                        let length = u32::from_be_bytes([
                            self.header[4],
                            self.header[5],
                            self.header[6],
                            self.header[7],
                        ]) as usize;
                        self.state = State::Payload {
                            stream: self.header[0],
                            remaining: length,
                        };
                    }
                }
                State::Payload { remaining: 0, .. } => {
                    self.state = State::Header { filled: 0 };
                }
                State::Payload { stream, remaining } => {
                    let take = remaining.min(input.len());
                    match stream {
                        STDOUT => self.stdout.extend_from_slice(&input[..take]),
                        STDERR => self.stderr.extend_from_slice(&input[..take]),
                        _ => {}
                    }
                    input = &input[take..];
                    self.state = State::Payload {
                        stream,
                        remaining: remaining - take,
                    };
                }
            }
        }
    }

    /// Bytes decoded so far as `(stdout, stderr)`; a partial trailing header
    /// is discarded.
    pub fn finish(self) -> (Vec<u8>, Vec<u8>) {
        (self.stdout, self.stderr)
    }
}

/// Encode one frame. Used by tests and engine fakes.
pub fn encode_frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(stream);
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
