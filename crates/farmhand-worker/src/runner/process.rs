//! Subprocess execution with streamed output.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use bytes::{Bytes, BytesMut};
use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};
use tracing::{debug, warn};

use farmhand_core::OutputStream;

use super::sink::OutputSink;
use super::Completion;

/// Longest single output line forwarded as-is.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Replaces a line longer than [`MAX_LINE_BYTES`].
pub const LINE_TOO_LONG_MARKER: &str = "[line too long, dropped]";

/// What to run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, PartialEq)]
enum Line {
    Text(String),
    TooLong,
}

/// Newline framing that survives over-long lines and invalid UTF-8.
struct OutputLines {
    inner: AnyDelimiterCodec,
}

impl OutputLines {
    fn new(max_line_bytes: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(
                b"\n".to_vec(),
                Vec::new(),
                max_line_bytes,
            ),
        }
    }

    fn map(
        result: Result<Option<Bytes>, AnyDelimiterCodecError>,
    ) -> Result<Option<Line>, std::io::Error> {
        match result {
            Ok(Some(chunk)) => {
                let text = String::from_utf8_lossy(&chunk);
                Ok(Some(Line::Text(text.trim_end_matches('\r').to_string())))
            }
            Ok(None) => Ok(None),
            // The codec discards the rest of the line on its own.
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Ok(Some(Line::TooLong)),
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for OutputLines {
    type Item = Line;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, std::io::Error> {
        Self::map(self.inner.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, std::io::Error> {
        Self::map(self.inner.decode_eof(buf))
    }
}

/// Spawn `spec`, forward its output to `sink` and wait for it to exit.
///
/// The child is killed if the returned future is dropped before it exits,
/// which is how timeouts and cancellation stop it.
pub async fn run_process(spec: &ProcessSpec, sink: &OutputSink) -> Completion {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(program = %spec.program, error = %e, "Failed to spawn command");
            return Completion::failed(format!("failed to start '{}': {}", spec.program, e));
        }
    };
    debug!(program = %spec.program, pid = ?child.id(), "Spawned command");

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Completion::failed("child output pipes unavailable");
    };

    let stdout = FramedRead::new(stdout, OutputLines::new(MAX_LINE_BYTES))
        .map(|line| (OutputStream::Stdout, line));
    let stderr = FramedRead::new(stderr, OutputLines::new(MAX_LINE_BYTES))
        .map(|line| (OutputStream::Stderr, line));
    let mut output = stdout.merge(stderr);

    while let Some((stream, line)) = output.next().await {
        match line {
            Ok(Line::Text(text)) => sink.line(stream, text),
            Ok(Line::TooLong) => sink.line(stream, LINE_TOO_LONG_MARKER),
            Err(e) => warn!(?stream, error = %e, "Error reading command output"),
        }
    }

    match child.wait().await {
        Ok(status) => completion_for(status),
        Err(e) => Completion::failed(format!("failed to wait for '{}': {}", spec.program, e)),
    }
}

fn completion_for(status: ExitStatus) -> Completion {
    match status.code() {
        Some(0) => Completion::ok(),
        Some(code) => Completion::exited(code),
        None => Completion::failed(signal_detail(status)),
    }
}

#[cfg(unix)]
fn signal_detail(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("killed by signal {}", signal),
        None => "terminated without exit code".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_detail(_status: ExitStatus) -> String {
    "terminated without exit code".to_string()
}
