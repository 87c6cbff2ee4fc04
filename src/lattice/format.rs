//! Line-oriented text form of a lattice.
//!
//! ```text
//! # ngram-decoder lattice
//! utterance <id>
//! frames <n>
//! nodes <count>
//! node <id> <word_id> <text> <start_frame> <end_frame> <kind>
//! arcs <count>
//! arc <from> <to> <ascr> <lscr>
//! end
//! ```
//!
//! Posteriors are not stored; recompute them after reading.

use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

use crate::error::DecoderError;
use crate::lattice::{Lattice, LatticeArc, LatticeNode, NodeKind};

pub const HEADER: &str = "# ngram-decoder lattice";

impl Lattice {
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_fmt_text(&mut out);
        out
    }

    fn write_fmt_text(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "{HEADER}")?;
        writeln!(out, "utterance {}", self.utterance_id)?;
        writeln!(out, "frames {}", self.n_frames)?;
        writeln!(out, "nodes {}", self.nodes.len())?;
        for (id, n) in self.nodes.iter().enumerate() {
            writeln!(
                out,
                "node {id} {} {} {} {} {}",
                n.word,
                n.text,
                n.start_frame,
                n.end_frame,
                n.kind.label()
            )?;
        }
        writeln!(out, "arcs {}", self.arcs.len())?;
        for a in &self.arcs {
            writeln!(out, "arc {} {} {} {}", a.from, a.to, a.ascr, a.lscr)?;
        }
        writeln!(out, "end")
    }

    pub fn save(&self, path: &Path) -> Result<(), DecoderError> {
        std::fs::write(path, self.to_text()).map_err(|e| DecoderError::io("write lattice", e))
    }

    pub fn load(path: &Path) -> Result<Self, DecoderError> {
        let text =
            std::fs::read_to_string(path).map_err(|e| DecoderError::io("read lattice", e))?;
        Self::read_text(&text)
    }

    pub fn read_text(text: &str) -> Result<Self, DecoderError> {
        let mut lines = Lines::new(text);

        let (line, header) = lines.next_line()?;
        if header != HEADER {
            return Err(DecoderError::lattice_format(line, "missing lattice header"));
        }
        let (line, rest) = lines.keyword("utterance")?;
        if rest.is_empty() {
            return Err(DecoderError::lattice_format(line, "empty utterance id"));
        }
        let utterance_id = rest.to_string();
        let n_frames: usize = lines.count("frames")?;

        let n_nodes: usize = lines.count("nodes")?;
        let mut nodes = Vec::with_capacity(n_nodes);
        for expected in 0..n_nodes {
            let (line, rest) = lines.keyword("node")?;
            let fields: Vec<&str> = rest.split_whitespace().collect();
            let [id, word, text, sf, ef, kind] = fields.as_slice() else {
                return Err(DecoderError::lattice_format(
                    line,
                    format!("node record needs 6 fields, found {}", fields.len()),
                ));
            };
            if parse::<usize>(line, id, "node id")? != expected {
                return Err(DecoderError::lattice_format(
                    line,
                    format!("node ids must be consecutive; expected {expected}"),
                ));
            }
            nodes.push(LatticeNode {
                word: parse(line, word, "word id")?,
                text: text.to_string(),
                start_frame: parse(line, sf, "start frame")?,
                end_frame: parse(line, ef, "end frame")?,
                kind: NodeKind::from_label(kind).ok_or_else(|| {
                    DecoderError::lattice_format(line, format!("unknown node kind '{kind}'"))
                })?,
            });
        }

        let n_arcs: usize = lines.count("arcs")?;
        let mut arcs = Vec::with_capacity(n_arcs);
        for _ in 0..n_arcs {
            let (line, rest) = lines.keyword("arc")?;
            let fields: Vec<&str> = rest.split_whitespace().collect();
            let [from, to, ascr, lscr] = fields.as_slice() else {
                return Err(DecoderError::lattice_format(
                    line,
                    format!("arc record needs 4 fields, found {}", fields.len()),
                ));
            };
            arcs.push(LatticeArc::new(
                parse(line, from, "arc source")?,
                parse(line, to, "arc destination")?,
                parse(line, ascr, "acoustic score")?,
                parse(line, lscr, "LM score")?,
            ));
        }

        let (line, tail) = lines.next_line()?;
        if tail != "end" {
            return Err(DecoderError::lattice_format(line, "expected 'end'"));
        }
        if let Some((line, extra)) = lines.peek_content() {
            return Err(DecoderError::lattice_format(
                line,
                format!("unexpected content after 'end': '{extra}'"),
            ));
        }

        Self::from_parts(&utterance_id, n_frames, nodes, arcs)
    }
}

struct Lines<'a> {
    inner: std::iter::Enumerate<std::str::Lines<'a>>,
    last_line: usize,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            inner: text.lines().enumerate(),
            last_line: 0,
        }
    }

    /// Next non-blank line with its 1-based number.
    fn next_line(&mut self) -> Result<(usize, &'a str), DecoderError> {
        for (i, raw) in self.inner.by_ref() {
            self.last_line = i + 1;
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                return Ok((i + 1, trimmed));
            }
        }
        Err(DecoderError::lattice_format(
            self.last_line + 1,
            "unexpected end of lattice text",
        ))
    }

    fn keyword(&mut self, word: &str) -> Result<(usize, &'a str), DecoderError> {
        let (line, content) = self.next_line()?;
        match content.split_once(char::is_whitespace) {
            Some((head, rest)) if head == word => Ok((line, rest.trim())),
            None if content == word => Ok((line, "")),
            _ => Err(DecoderError::lattice_format(
                line,
                format!("expected '{word}' record"),
            )),
        }
    }

    fn count(&mut self, word: &str) -> Result<usize, DecoderError> {
        let (line, rest) = self.keyword(word)?;
        parse(line, rest, word)
    }

    fn peek_content(&mut self) -> Option<(usize, &'a str)> {
        self.inner
            .by_ref()
            .map(|(i, raw)| (i + 1, raw.trim()))
            .find(|(_, s)| !s.is_empty())
    }
}

fn parse<T: FromStr>(line: usize, field: &str, what: &str) -> Result<T, DecoderError> {
    field
        .parse()
        .map_err(|_| DecoderError::lattice_format(line, format!("invalid {what} '{field}'")))
}
