//! Bounded capture of a child's stdout/stderr. However much a command
//! prints, we keep the first 4 KiB and the last 4 KiB of it, after
//! discarding the interior of carriage-return progress-bar runs.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::task::JoinHandle;

pub const SAVED_HEAD_BYTES: usize = 4096;
pub const SAVED_TAIL_BYTES: usize = 4096;

const TRUNCATION_MARKER: &str = "…";

/// Keeps the first [`SAVED_HEAD_BYTES`] verbatim and then a rolling window
/// of the last [`SAVED_TAIL_BYTES`]. Assembly marks any gap.
#[derive(Debug, Default)]
pub struct OutputSaver {
    head: Vec<u8>,
    tail: VecDeque<u8>,
    trimmed: u64,
}

impl OutputSaver {
    pub fn write(&mut self, mut bytes: &[u8]) {
        if self.head.len() < SAVED_HEAD_BYTES {
            let take = (SAVED_HEAD_BYTES - self.head.len()).min(bytes.len());
            self.head.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
        if bytes.is_empty() {
            return;
        }
        self.tail.extend(bytes.iter().copied());
        while self.tail.len() > SAVED_TAIL_BYTES {
            self.tail.pop_front();
            self.trimmed += 1;
        }
    }

    pub fn assemble(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.head);
        if self.trimmed > 0 {
            out.extend_from_slice(TRUNCATION_MARKER.as_bytes());
        }
        out.extend(self.tail.drain(..));
        out
    }
}

/// Splits input on `\n` and `\r` boundaries and, within any contiguous run
/// of `\r`-terminated fragments, forwards only the first and last fragment
/// to the saver. Typical progress bars collapse to their first and final
/// frames; everything else passes through untouched.
#[derive(Debug, Default)]
pub struct ProgressFilter {
    saver: OutputSaver,
    partial: Vec<u8>,
    in_run: bool,
    held: Vec<u8>,
}

impl ProgressFilter {
    pub fn feed(&mut self, chunk: &[u8]) {
        let mut rest = chunk;
        while let Some(idx) = rest.iter().position(|&b| b == b'\n' || b == b'\r') {
            let (line, tail) = rest.split_at(idx + 1);
            self.partial.extend_from_slice(line);
            let frag = std::mem::take(&mut self.partial);
            self.fragment(frag);
            rest = tail;
        }
        self.partial.extend_from_slice(rest);
    }

    fn fragment(&mut self, frag: Vec<u8>) {
        if frag.last() == Some(&b'\r') {
            if self.in_run {
                self.held = frag;
            } else {
                self.in_run = true;
                self.saver.write(&frag);
            }
        } else {
            if self.in_run {
                if !self.held.is_empty() {
                    let held = std::mem::take(&mut self.held);
                    self.saver.write(&held);
                }
                self.in_run = false;
            }
            self.saver.write(&frag);
        }
    }

    /// Flush any held progress frame and trailing unterminated fragment,
    /// then assemble the saved bytes.
    pub fn finish(&mut self) -> Vec<u8> {
        if self.in_run && !self.held.is_empty() {
            let held = std::mem::take(&mut self.held);
            self.saver.write(&held);
        }
        self.in_run = false;
        if !self.partial.is_empty() {
            let partial = std::mem::take(&mut self.partial);
            self.saver.write(&partial);
        }
        self.saver.assemble()
    }
}

/// Handle on an in-flight capture. The saved bytes can be extracted even if
/// the reader task was aborted because the child was killed.
#[derive(Clone)]
pub struct Capture(Arc<Mutex<ProgressFilter>>);

impl Capture {
    pub fn into_bytes(self) -> Vec<u8> {
        self.0.lock().unwrap().finish()
    }
}

/// Drain `reader` through a [`ProgressFilter`] on a background task.
pub fn capture<ReadT>(reader: ReadT) -> (Capture, JoinHandle<io::Result<()>>)
where
    ReadT: AsyncRead + Send + Unpin + 'static,
{
    let filter = Arc::new(Mutex::new(ProgressFilter::default()));
    let writer = filter.clone();
    let handle = tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            writer.lock().unwrap().feed(&buf[..n]);
        }
    });
    (Capture(filter), handle)
}
