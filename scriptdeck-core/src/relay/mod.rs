//! Output relay.
//!
//! Turns raw process output into the block's single growing text buffer and
//! pushes every appended fragment to the host as it arrives.
//!
//! - stdout is decoded chunk by chunk (no line buffering)
//! - stderr is read line by line and shown as `[Error]` lines, unless the
//!   session diverts a line to dependency recovery
//! - the first write of a run clears the previous run's text

pub mod normalize;

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::{BlockId, HostSink, SessionEvent};
use normalize::{LineNormalizer, Utf8ChunkDecoder};

pub const ERROR_PREFIX: &str = "[Error] ";
pub const AUTOFIX_PREFIX: &str = "[AutoFix] ";

const READ_CHUNK: usize = 4096;

#[derive(Debug, Default)]
struct OutputBuffer {
    text: String,
    pending_clear: bool,
    normalizer: LineNormalizer,
}

/// Single writer of a session's output buffer.
pub struct OutputRelay {
    block: BlockId,
    sink: Arc<dyn HostSink>,
    buffer: Mutex<OutputBuffer>,
}

impl std::fmt::Debug for OutputRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRelay")
            .field("block", &self.block)
            .field("sink", &"Arc<dyn HostSink>")
            .finish()
    }
}

impl OutputRelay {
    pub fn new(block: BlockId, sink: Arc<dyn HostSink>) -> Self {
        Self {
            block,
            sink,
            buffer: Mutex::new(OutputBuffer::default()),
        }
    }

    pub fn sink(&self) -> &Arc<dyn HostSink> {
        &self.sink
    }

    /// Arm the lazy clear: the previous text stays visible until the new
    /// run writes something.
    pub fn begin_run(&self) {
        let mut buf = self.lock();
        buf.pending_clear = true;
    }

    /// Snapshot of the accumulated text.
    pub fn text(&self) -> String {
        self.lock().text.clone()
    }

    /// Append raw stdout text.
    pub fn push_stdout(&self, chunk: &str) {
        self.append(chunk, false);
    }

    /// Append a stderr line as an error line.
    pub fn push_error_line(&self, line: &str) {
        self.append(&format!("{ERROR_PREFIX}{line}\n"), true);
    }

    /// Append an auto-fix annotation line.
    pub fn push_autofix_line(&self, message: &str) {
        self.append(&format!("{AUTOFIX_PREFIX}{message}\n"), true);
    }

    /// Append a plain status line on its own line.
    pub fn push_status_line(&self, message: &str) {
        self.append(&format!("{message}\n"), true);
    }

    /// Replace the whole buffer right away (no lazy clear).
    pub fn replace(&self, text: &str) {
        let mut buf = self.lock();
        buf.pending_clear = false;
        buf.text.clear();
        buf.normalizer.reset();
        let normalized = buf.normalizer.normalize(text);
        buf.text.push_str(&normalized);

        self.sink.emit(SessionEvent::OutputCleared { block: self.block });
        if !normalized.is_empty() {
            self.sink.emit(SessionEvent::Output {
                block: self.block,
                text: normalized,
            });
        }
    }

    fn append(&self, chunk: &str, own_line: bool) {
        let mut buf = self.lock();

        if buf.pending_clear {
            buf.pending_clear = false;
            buf.text.clear();
            buf.normalizer.reset();
            self.sink.emit(SessionEvent::OutputCleared { block: self.block });
        }

        let mut normalized = String::new();
        if own_line && !buf.text.is_empty() && !buf.text.ends_with('\n') {
            normalized.push_str(&buf.normalizer.normalize("\n"));
        }
        normalized.push_str(&buf.normalizer.normalize(chunk));
        if normalized.is_empty() {
            return;
        }

        buf.text.push_str(&normalized);
        // Emit while holding the buffer so the host sees fragments in buffer order.
        self.sink.emit(SessionEvent::Output {
            block: self.block,
            text: normalized,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OutputBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ════════════════════════════════════════════════════════════════════
// Pumps
// ════════════════════════════════════════════════════════════════════

/// Stream stdout into the relay until end-of-stream. A read error (the
/// handle was closed under us) ends the pump like EOF does.
pub async fn pump_stdout<R>(mut reader: R, relay: Arc<OutputRelay>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = Utf8ChunkDecoder::new();
    let mut buf = [0u8; READ_CHUNK];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() {
                    relay.push_stdout(&text);
                }
            }
            Err(e) => {
                tracing::debug!("stdout pump ended: {}", e);
                break;
            }
        }
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        relay.push_stdout(&tail);
    }
}

/// Stream stderr line by line into `on_line`, with the line terminator
/// stripped.
pub async fn pump_stderr<R, F>(reader: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::with_capacity(256);

    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches(['\r', '\n']);
                on_line(line.to_string());
            }
            Err(e) => {
                tracing::debug!("stderr pump ended: {}", e);
                break;
            }
        }
    }
}
