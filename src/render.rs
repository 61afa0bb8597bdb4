//! Terminal output for answers, citations and documents.

use std::io::Write;

use quarry_core::document::Document;
use quarry_core::seeds::{by_relevance, KnowledgeSeed};

/// Prints a session's growing response without repeating what is already on
/// screen.
#[derive(Default)]
pub struct AnswerPrinter {
    shown: String,
}

impl AnswerPrinter {
    /// Write whatever `response` adds over what was shown. A response that
    /// no longer extends the shown text (a replacing complete frame) is
    /// printed again in full on a fresh line.
    pub fn show(&mut self, out: &mut impl Write, response: &str) -> std::io::Result<()> {
        if response == self.shown {
            return Ok(());
        }
        match response.strip_prefix(self.shown.as_str()) {
            Some(added) => out.write_all(added.as_bytes())?,
            None => {
                if !self.shown.is_empty() {
                    out.write_all(b"\n")?;
                }
                out.write_all(response.as_bytes())?;
            }
        }
        out.flush()?;
        self.shown = response.to_string();
        Ok(())
    }

    pub fn finish(&self, out: &mut impl Write) -> std::io::Result<()> {
        if !self.shown.is_empty() && !self.shown.ends_with('\n') {
            out.write_all(b"\n")?;
        }
        out.flush()
    }
}

pub fn seed_lines(seeds: &[KnowledgeSeed]) -> Vec<String> {
    by_relevance(seeds)
        .into_iter()
        .enumerate()
        .map(|(idx, seed)| {
            format!(
                "[{}] {} (distance {:.3}, {} tokens)",
                idx + 1,
                seed.label(),
                seed.nip,
                seed.tokens
            )
        })
        .collect()
}

pub fn document_line(document: &Document) -> String {
    let mut line = format!("{}  {}  {}", document.id, document.status, document.name);
    if let Some(error) = &document.error {
        line.push_str(&format!("  ({error})"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::ids::DocumentId;

    fn shown(steps: &[&str]) -> String {
        let mut printer = AnswerPrinter::default();
        let mut out = Vec::new();
        for step in steps {
            printer.show(&mut out, step).unwrap();
        }
        printer.finish(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn appends_only_new_text() {
        assert_eq!(shown(&["", "A", "AB", "AB", "ABC"]), "ABC\n");
    }

    #[test]
    fn replaced_answer_starts_a_new_line() {
        assert_eq!(shown(&["draft", "Final"]), "draft\nFinal\n");
    }

    #[test]
    fn nothing_shown_prints_nothing() {
        assert_eq!(shown(&[]), "");
    }

    #[test]
    fn seeds_listed_most_relevant_first() {
        let mut far = KnowledgeSeed::new("far", 0.9);
        far.title = Some("Far".into());
        let mut near = KnowledgeSeed::new("near", 0.1);
        near.id = Some("kb-7".into());
        near.tokens = 42;

        assert_eq!(
            seed_lines(&[far, near]),
            vec![
                "[1] kb-7 (distance 0.100, 42 tokens)".to_string(),
                "[2] Far (distance 0.900, 0 tokens)".to_string(),
            ]
        );
    }

    #[test]
    fn document_line_includes_error() {
        let mut document = Document::placeholder("a.pdf", 10);
        document.promote(DocumentId::from_raw("doc-1"));
        document.fail("unsupported format");
        assert_eq!(
            document_line(&document),
            "doc-1  error  a.pdf  (unsupported format)"
        );
    }
}
