//! Standard streams as seen from inside an execution context.
//!
//! Input is a fixed list of lines handed out one at a time. Output is
//! accumulated into a transcript and forwarded to the orchestrator line by
//! line as it is produced. Every hook checks the kill token first, so a
//! destroyed context stops the program at its next host call.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::rpc::ContextEvent;
use crate::error::ExecutionError;
use crate::vfs::MemoryFs;

/// Pull-based stdin over pre-supplied lines.
#[derive(Debug, Default)]
struct InputQueue {
    lines: VecDeque<String>,
}

impl InputQueue {
    fn next(&mut self) -> Result<String, ExecutionError> {
        self.lines.pop_front().ok_or(ExecutionError::InputExhausted)
    }
}

/// Push-based stdout that keeps a transcript and streams each line out.
#[derive(Debug)]
struct OutputBuffer {
    transcript: String,
    events: mpsc::UnboundedSender<ContextEvent>,
}

impl OutputBuffer {
    fn push(&mut self, line: &str) {
        self.transcript.push_str(line);
        self.transcript.push('\n');
        // The receiver only goes away when the context is being torn down.
        let _ = self.events.send(ContextEvent::Output(line.to_string()));
    }
}

/// Host services available to an interpreter while it runs a program.
#[derive(Debug)]
pub struct Host<'a> {
    stdin: InputQueue,
    stdout: OutputBuffer,
    fs: &'a mut MemoryFs,
    kill: CancellationToken,
}

impl<'a> Host<'a> {
    pub(crate) fn new(
        input: Vec<String>,
        fs: &'a mut MemoryFs,
        kill: CancellationToken,
        events: mpsc::UnboundedSender<ContextEvent>,
    ) -> Self {
        Self {
            stdin: InputQueue {
                lines: input.into(),
            },
            stdout: OutputBuffer {
                transcript: String::new(),
                events,
            },
            fs,
            kill,
        }
    }

    /// Fail with [`ExecutionError::Killed`] if the context has been destroyed.
    ///
    /// Long-running interpreters should call this periodically; it is the
    /// only way a destroyed context can stop a program that never touches
    /// its streams.
    pub fn check_alive(&self) -> Result<(), ExecutionError> {
        if self.kill.is_cancelled() {
            Err(ExecutionError::Killed)
        } else {
            Ok(())
        }
    }

    /// Next line of input.
    ///
    /// Fails with [`ExecutionError::InputExhausted`] once all supplied lines
    /// have been read.
    pub fn read_line(&mut self) -> Result<String, ExecutionError> {
        self.check_alive()?;
        self.stdin.next()
    }

    /// Emit one line of output, without its terminator.
    pub fn write_line(&mut self, line: &str) -> Result<(), ExecutionError> {
        self.check_alive()?;
        self.stdout.push(line);
        Ok(())
    }

    /// Busy-wait for `duration`, the way the harness replaces `time.sleep`.
    pub fn sleep(&self, duration: Duration) -> Result<(), ExecutionError> {
        let start = Instant::now();
        while start.elapsed() < duration {
            self.check_alive()?;
            std::thread::yield_now();
        }
        Ok(())
    }

    /// The context's private filesystem.
    pub fn fs(&mut self) -> &mut MemoryFs {
        self.fs
    }

    /// Everything written so far, each line terminated by `\n`.
    pub fn transcript(&self) -> &str {
        &self.stdout.transcript
    }

    pub(crate) fn into_transcript(self) -> String {
        self.stdout.transcript
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn host<'a>(
        fs: &'a mut MemoryFs,
        input: &[&str],
    ) -> (Host<'a>, mpsc::UnboundedReceiver<ContextEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let input = input.iter().map(|s| s.to_string()).collect();
        (Host::new(input, fs, CancellationToken::new(), tx), rx)
    }

    #[test]
    fn test_input_lines_then_exhausted() {
        let mut fs = MemoryFs::new();
        let (mut host, _rx) = host(&mut fs, &["Pen", "Book"]);

        assert_eq!(host.read_line().unwrap(), "Pen");
        assert_eq!(host.read_line().unwrap(), "Book");
        assert_eq!(host.read_line(), Err(ExecutionError::InputExhausted));
    }

    #[test]
    fn test_output_accumulates_and_streams() {
        let mut fs = MemoryFs::new();
        let (mut host, mut rx) = host(&mut fs, &[]);

        host.write_line("one").unwrap();
        host.write_line("").unwrap();

        assert_eq!(host.into_transcript(), "one\n\n");
        assert!(matches!(rx.try_recv().unwrap(), ContextEvent::Output(l) if l == "one"));
        assert!(matches!(rx.try_recv().unwrap(), ContextEvent::Output(l) if l.is_empty()));
    }

    #[test]
    fn test_killed_host_rejects_every_hook() {
        let mut fs = MemoryFs::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        let mut host = Host::new(vec!["x".to_string()], &mut fs, kill.clone(), tx);

        kill.cancel();

        assert_eq!(host.check_alive(), Err(ExecutionError::Killed));
        assert_eq!(host.read_line(), Err(ExecutionError::Killed));
        assert_eq!(host.write_line("y"), Err(ExecutionError::Killed));
        assert_eq!(
            host.sleep(Duration::from_secs(60)),
            Err(ExecutionError::Killed)
        );
    }

    #[test]
    fn test_sleep_waits_at_least_duration() {
        let mut fs = MemoryFs::new();
        let (host, _rx) = host(&mut fs, &[]);

        let start = Instant::now();
        host.sleep(Duration::from_millis(20)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
