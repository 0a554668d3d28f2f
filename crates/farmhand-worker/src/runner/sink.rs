//! Where command output goes.

use std::sync::Mutex;

use tokio::sync::mpsc::UnboundedSender;

use farmhand_core::{ExecutionEvent, LogRange, OutputStream};

/// Line emitted once when a command's output hits the cap.
pub const TRUNCATION_MARKER: &str = "[output truncated]";

#[derive(Debug)]
struct SinkState {
    /// Command output bytes accepted so far, counted against the cap.
    accepted: u64,
    /// Position in the task's log stream.
    offset: u64,
    truncated: bool,
}

/// Forwards the output of one command as [`ExecutionEvent::Output`] events.
///
/// Every forwarded line occupies `line.len() + 1` bytes of the task log, the
/// same way the worker assembles the log it pushes, so the offsets recorded
/// here match the log the manager receives.
#[derive(Debug)]
pub struct OutputSink {
    index: usize,
    events: UnboundedSender<ExecutionEvent>,
    max_bytes: u64,
    start: u64,
    state: Mutex<SinkState>,
}

impl OutputSink {
    /// Sink for command `index`, whose output starts at `log_offset`.
    pub fn new(
        index: usize,
        events: UnboundedSender<ExecutionEvent>,
        max_bytes: u64,
        log_offset: u64,
    ) -> Self {
        Self {
            index,
            events,
            max_bytes,
            start: log_offset,
            state: Mutex::new(SinkState {
                accepted: 0,
                offset: log_offset,
                truncated: false,
            }),
        }
    }

    /// Forward one line of command output, subject to the output cap.
    pub fn line(&self, stream: OutputStream, line: impl Into<String>) {
        let line = line.into();
        let size = line.len() as u64 + 1;
        let mut state = self.lock();

        if state.truncated {
            return;
        }
        if state.accepted + size > self.max_bytes {
            state.truncated = true;
            self.forward(&mut state, OutputStream::Worker, TRUNCATION_MARKER.to_string());
            return;
        }
        state.accepted += size;
        self.forward(&mut state, stream, line);
    }

    /// Forward a line produced by the worker itself. Not counted against the cap.
    pub fn note(&self, line: impl Into<String>) {
        let mut state = self.lock();
        self.forward(&mut state, OutputStream::Worker, line.into());
    }

    pub fn is_truncated(&self) -> bool {
        self.lock().truncated
    }

    /// Byte range of this command's lines within the task log.
    pub fn log_range(&self) -> LogRange {
        LogRange::new(self.start, self.lock().offset)
    }

    /// Task log offset just past the last forwarded line.
    pub fn offset(&self) -> u64 {
        self.lock().offset
    }

    fn forward(&self, state: &mut SinkState, stream: OutputStream, line: String) {
        state.offset += line.len() as u64 + 1;
        // A closed receiver means nobody is collecting the log anymore.
        let _ = self.events.send(ExecutionEvent::Output {
            index: self.index,
            stream,
            line,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
