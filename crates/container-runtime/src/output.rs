//! Line assembly for chunked exec output

use tokio::sync::mpsc;

use crate::types::{ExecOutput, OutputLine, OutputStream};

/// Accumulates exec output and forwards each complete line as it arrives.
///
/// Runtimes deliver output in arbitrary chunks, which may split a UTF-8
/// sequence. Bytes are buffered and only decoded once their line is
/// complete (or at `finish`).
pub struct OutputCollector {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_partial: Vec<u8>,
    stderr_partial: Vec<u8>,
    lines: Option<mpsc::UnboundedSender<OutputLine>>,
}

impl OutputCollector {
    pub fn new(lines: Option<mpsc::UnboundedSender<OutputLine>>) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_partial: Vec::new(),
            stderr_partial: Vec::new(),
            lines,
        }
    }

    /// Feed a raw chunk from one stream
    pub fn push(&mut self, stream: OutputStream, chunk: &[u8]) {
        let (full, partial) = match stream {
            OutputStream::Stdout => (&mut self.stdout, &mut self.stdout_partial),
            OutputStream::Stderr => (&mut self.stderr, &mut self.stderr_partial),
        };
        full.extend_from_slice(chunk);
        partial.extend_from_slice(chunk);

        while let Some(idx) = partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = partial.drain(..=idx).collect();
            let line = decode_line(&raw);
            if let Some(tx) = &self.lines {
                // A dropped receiver only means nobody is listening anymore
                let _ = tx.send(OutputLine { stream, line });
            }
        }
    }

    /// Feed one already-split line
    pub fn push_line(&mut self, stream: OutputStream, line: &str) {
        let mut chunk = Vec::with_capacity(line.len() + 1);
        chunk.extend_from_slice(line.as_bytes());
        chunk.push(b'\n');
        self.push(stream, &chunk);
    }

    /// Flush unterminated trailing lines and return everything collected
    pub fn finish(mut self, exit_code: i64) -> ExecOutput {
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let partial = match stream {
                OutputStream::Stdout => std::mem::take(&mut self.stdout_partial),
                OutputStream::Stderr => std::mem::take(&mut self.stderr_partial),
            };
            if !partial.is_empty() {
                if let Some(tx) = &self.lines {
                    let _ = tx.send(OutputLine {
                        stream,
                        line: decode_line(&partial),
                    });
                }
            }
        }
        ExecOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            exit_code,
        }
    }

    /// Output collected so far, without flushing
    pub fn snapshot(&self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}
