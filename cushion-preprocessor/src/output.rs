//! Output plumbing: the deferred-sink queue, line markers and the depfile
//! dependency set.
//!
//! Output nodes form a queue in creation order. A deferred sink starts
//! unfinished and buffers everything written while it is selected; plain
//! writes that happen while any node is still queued are buffered into
//! anonymous (always-finished) nodes behind it, so that bytes reach the real
//! output strictly in node-creation order. Whenever the head of the queue is
//! finished, the finished prefix is flushed.

use std::{
    collections::HashSet,
    io::Write,
};

use cushion_foundation::{
    errors::{Error, Result},
    location::SourceLocation,
};

use crate::tokens::Origin;

/// Identifier of a deferred sink, stable across queue flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkId(u64);

#[derive(Debug)]
struct OutputNode {
    id: Option<SinkId>,
    buffer: String,
    finished: bool,
}

pub struct Output {
    destination: Box<dyn Write>,
    queue: Vec<OutputNode>,
    selected: Option<SinkId>,
    next_id: u64,
    /// Whether the byte most recently written to the real destination was a
    /// newline; fresh output counts as a line start.
    direct_at_line_start: bool,
}

impl Output {
    pub fn new(destination: Box<dyn Write>) -> Self {
        Self {
            destination,
            queue: Vec::new(),
            selected: None,
            next_id: 0,
            direct_at_line_start: true,
        }
    }

    /// Creates a deferred sink at the current output position. Content
    /// written directly afterwards goes after the sink's eventual content.
    pub fn add_deferred_sink(&mut self) -> SinkId {
        let id = SinkId(self.next_id);
        self.next_id += 1;
        self.queue.push(OutputNode {
            id: Some(id),
            buffer: String::new(),
            finished: false,
        });
        id
    }

    /// Routes subsequent writes into the given unfinished sink, or back to
    /// the regular position when `None`.
    pub fn select_sink(&mut self, sink: Option<SinkId>) {
        if let Some(id) = sink {
            let node = self
                .queue
                .iter()
                .find(|node| node.id == Some(id))
                .expect("selected sink must still be queued");
            assert!(!node.finished, "only unfinished sinks can be selected");
        }
        self.selected = sink;
    }

    /// Marks the sink finished; if it was (part of) the blocking prefix, the
    /// prefix is flushed to the real output.
    pub fn finish_sink(&mut self, sink: SinkId) -> Result<()> {
        if self.selected == Some(sink) {
            self.selected = None;
        }
        let node = self
            .queue
            .iter_mut()
            .find(|node| node.id == Some(sink))
            .expect("finished sink must still be queued");
        node.finished = true;
        self.flush_finished_prefix()
    }

    fn flush_finished_prefix(&mut self) -> Result<()> {
        while self.queue.first().is_some_and(|node| node.finished) {
            let node = self.queue.remove(0);
            if let Some(last) = node.buffer.as_bytes().last() {
                self.direct_at_line_start = *last == b'\n';
            }
            write_all(&mut self.destination, node.buffer.as_bytes())?;
        }
        Ok(())
    }

    pub fn write_str(&mut self, text: &str) -> Result<()> {
        if let Some(selected) = self.selected {
            let node = self
                .queue
                .iter_mut()
                .find(|node| node.id == Some(selected))
                .expect("selected sink must still be queued");
            node.buffer.push_str(text);
            return Ok(());
        }

        if self.queue.is_empty() {
            if let Some(last) = text.as_bytes().last() {
                self.direct_at_line_start = *last == b'\n';
            }
            return write_all(&mut self.destination, text.as_bytes());
        }

        // Buffer behind the pending sinks, coalescing into the tail node
        // when it is already an anonymous one.
        match self.queue.last_mut() {
            Some(node) if node.id.is_none() => node.buffer.push_str(text),
            _ => self.queue.push(OutputNode {
                id: None,
                buffer: text.to_owned(),
                finished: true,
            }),
        }
        Ok(())
    }

    /// Whether the next write lands at the start of a line, as far as the
    /// logical output stream is concerned.
    fn at_line_start(&self) -> bool {
        if let Some(selected) = self.selected {
            let node = self
                .queue
                .iter()
                .find(|node| node.id == Some(selected))
                .expect("selected sink must still be queued");
            return node.buffer.is_empty() || node.buffer.ends_with('\n');
        }
        match self.queue.last() {
            Some(node) if node.id.is_none() => node.buffer.ends_with('\n'),
            Some(_) => true,
            None => self.direct_at_line_start,
        }
    }

    /// Line markers must begin a line; a newline is inserted first whenever
    /// the stream is mid-line (skipped newline tokens leave it there).
    pub fn line_marker(&mut self, file: &str, line: u32) -> Result<()> {
        if !self.at_line_start() {
            self.write_str("\n")?;
        }
        self.write_str(&format!("#line {line} \"{file}\"\n"))
    }

    pub fn line_marker_at(&mut self, origin: &Origin) -> Result<()> {
        self.line_marker(&origin.file, origin.line)
    }

    /// Verifies every sink was finished and flushes the remaining bytes.
    pub fn finalize(&mut self) -> Result<()> {
        if self.queue.iter().any(|node| !node.finished) {
            return Err(Error::extension(
                SourceLocation::none(),
                "Finalizing output while a deferred sink is still unfinished.",
            ));
        }
        self.flush_finished_prefix()?;
        self.destination.flush().map_err(output_error)
    }
}

fn write_all(destination: &mut Box<dyn Write>, bytes: &[u8]) -> Result<()> {
    destination.write_all(bytes).map_err(output_error)
}

fn output_error(error: std::io::Error) -> Error {
    Error::io(
        SourceLocation::none(),
        format!("Failed to output preprocessed code: {error}."),
    )
}

/// Absolute paths of every file opened for tokenization, in first-open
/// order. Written once at the end of execution.
#[derive(Debug, Default)]
pub struct DepfileSet {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl DepfileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, absolute_path: &str) {
        if self.seen.insert(absolute_path.to_owned()) {
            self.ordered.push(absolute_path.to_owned());
        }
    }

    /// Renders the Make-style depfile line. Paths with whitespace are not
    /// supported by the format.
    pub fn render(&self, output_path: &str) -> String {
        let mut line = format!("\"{output_path}\":");
        for path in &self.ordered {
            line.push(' ');
            line.push_str(path);
        }
        line.push('\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    #[derive(Clone, Default)]
    struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn output_over(buffer: &SharedBuffer) -> Output {
        Output::new(Box::new(buffer.clone()))
    }

    fn contents(buffer: &SharedBuffer) -> String {
        String::from_utf8(buffer.0.borrow().clone()).unwrap()
    }

    #[test]
    fn direct_writes_pass_through() {
        let buffer = SharedBuffer::default();
        let mut output = output_over(&buffer);
        output.write_str("hello ").unwrap();
        output.write_str("world").unwrap();
        assert_eq!(contents(&buffer), "hello world");
    }

    #[test]
    fn sink_content_lands_before_later_writes() {
        let buffer = SharedBuffer::default();
        let mut output = output_over(&buffer);

        output.write_str("before ").unwrap();
        let sink = output.add_deferred_sink();
        output.write_str("after ").unwrap();

        output.select_sink(Some(sink));
        output.write_str("deferred ").unwrap();
        output.select_sink(None);
        output.write_str("tail").unwrap();

        // Nothing past the sink reaches the file until it finishes.
        assert_eq!(contents(&buffer), "before ");
        output.finish_sink(sink).unwrap();
        assert_eq!(contents(&buffer), "before deferred after tail");
    }

    #[test]
    fn sinks_flush_in_creation_order() {
        let buffer = SharedBuffer::default();
        let mut output = output_over(&buffer);

        let first = output.add_deferred_sink();
        let second = output.add_deferred_sink();

        output.select_sink(Some(second));
        output.write_str("2").unwrap();
        output.select_sink(Some(first));
        output.write_str("1").unwrap();
        output.select_sink(None);

        output.finish_sink(second).unwrap();
        assert_eq!(contents(&buffer), "");
        output.finish_sink(first).unwrap();
        assert_eq!(contents(&buffer), "12");
    }

    #[test]
    fn finalize_rejects_unfinished_sinks() {
        let buffer = SharedBuffer::default();
        let mut output = output_over(&buffer);
        let _sink = output.add_deferred_sink();
        let error = output.finalize().unwrap_err();
        assert!(error.message.contains("unfinished"), "{error}");
    }

    #[test]
    fn depfile_keeps_first_open_order_and_dedupes() {
        let mut depfile = DepfileSet::new();
        depfile.add("/a/one.c");
        depfile.add("/b/two.h");
        depfile.add("/a/one.c");
        assert_eq!(
            depfile.render("/out/result.c"),
            "\"/out/result.c\": /a/one.c /b/two.h\n"
        );
    }
}
