//! Console byte stream to logical lines.
//!
//! Chunks are fed through a `vte` parser, which drops ANSI escape sequences
//! and keeps UTF-8 sequences split across chunks intact. Printable text is
//! collected into the current line; CR, LF and CR LF terminate it.
//!
//! The unterminated tail of a chunk is held as a partial line and prefixed to
//! the next chunk, except when it already looks like an interactive prompt.
//! Prompts never end in a newline, so they are emitted as soon as they are
//! seen. An empty chunk marks silence or end of stream and flushes the held
//! fragment.

use vte::{Parser, Perform};

use super::patterns::PromptShapes;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const TAB: u8 = b'\t';
const BACKSPACE: u8 = 0x08;

/// Collects parser output into lines.
#[derive(Debug, Default)]
struct LineCollector {
    current: String,
    after_cr: bool,
    // A prompt was emitted early; its own terminator must not yield an
    // extra empty line
    after_prompt: bool,
    lines: Vec<String>,
}

impl LineCollector {
    fn terminate(&mut self) {
        if self.after_prompt && self.current.is_empty() {
            self.after_prompt = false;
            return;
        }
        self.after_prompt = false;
        self.lines.push(std::mem::take(&mut self.current));
    }
}

impl Perform for LineCollector {
    fn print(&mut self, c: char) {
        self.after_cr = false;
        self.after_prompt = false;
        // Invalid input decodes to the replacement character; drop it
        if c != char::REPLACEMENT_CHARACTER {
            self.current.push(c);
        }
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            CR => {
                self.terminate();
                self.after_cr = true;
            }
            LF => {
                if !self.after_cr {
                    self.terminate();
                }
                self.after_cr = false;
            }
            TAB => {
                self.after_cr = false;
                self.after_prompt = false;
                self.current.push('\t');
            }
            BACKSPACE => {
                self.after_cr = false;
                self.current.pop();
            }
            _ => {}
        }
    }
}

/// Stateful decoder turning console chunks into complete lines.
pub struct LineDecoder {
    parser: Parser,
    collector: LineCollector,
    prompts: PromptShapes,
}

impl LineDecoder {
    /// Create a decoder recognising the given prompts.
    pub fn new(prompts: PromptShapes) -> Self {
        Self {
            parser: Parser::new(),
            collector: LineCollector::default(),
            prompts,
        }
    }

    /// Prompt shapes used for the fast path.
    pub fn prompts(&self) -> &PromptShapes {
        &self.prompts
    }

    /// The fragment currently held back, if any.
    pub fn pending(&self) -> Option<&str> {
        let current = self.collector.current.as_str();
        (!current.is_empty()).then_some(current)
    }

    /// Decode one chunk and return every line it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        if chunk.is_empty() {
            return self.flush().into_iter().collect();
        }

        self.parser.advance(&mut self.collector, chunk);

        let mut lines = std::mem::take(&mut self.collector.lines);
        if !self.collector.current.is_empty() && self.prompts.is_prompt(&self.collector.current)
        {
            lines.push(std::mem::take(&mut self.collector.current));
            self.collector.after_prompt = true;
        }
        lines
    }

    /// Emit the held fragment, if any.
    pub fn flush(&mut self) -> Option<String> {
        self.pending()?;
        Some(std::mem::take(&mut self.collector.current))
    }

    /// Forget the held fragment and any partial escape sequence.
    pub fn reset(&mut self) {
        self.parser = Parser::new();
        self.collector = LineCollector::default();
    }
}
