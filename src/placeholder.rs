//! Rewrites the "current document" placeholder inside raw expression text.
//!
//! Fragments such as `$filter`, `$sort`, `$groupBy` and computed `$project`
//! values are written against a logical document (`doc.price > 10`). Before
//! they are emitted, each occurrence of the placeholder, and of any
//! coordinate-suffixed form of it (`doc_1_0`), is replaced with the loop
//! variable of the stage being compiled. The substitution is textual and does
//! not parse the expression.

use regex::{Captures, Regex};

use crate::error::{Error, Result};
use crate::stage::Coordinate;

#[derive(Debug, Clone)]
pub struct PlaceholderRewriter {
    placeholder: String,
    pattern: Regex,
}

impl PlaceholderRewriter {
    pub fn new(placeholder: &str) -> Result<Self> {
        // The leading group stands in for a look-behind: a placeholder that
        // follows `.` is an attribute name, not a variable.
        let pattern = Regex::new(&format!(
            r"(^|[^.\w]){}(?:_\d+_\d+)?\b",
            regex::escape(placeholder)
        ))
        .map_err(|e| Error::InvalidConfig(format!("placeholder pattern: {e}")))?;
        Ok(Self {
            placeholder: placeholder.to_string(),
            pattern,
        })
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Loop variable for `coord`, e.g. `doc_0_2`.
    pub fn variable(&self, coord: Coordinate) -> String {
        coord.document(&self.placeholder)
    }

    pub fn rewrite(&self, text: &str, coord: Coordinate) -> String {
        let target = self.variable(coord);
        self.pattern
            .replace_all(text, |caps: &Captures| format!("{}{}", &caps[1], target))
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> PlaceholderRewriter {
        PlaceholderRewriter::new("doc").unwrap()
    }

    #[test]
    fn rewrites_bare_placeholder() {
        let r = rewriter();
        assert_eq!(
            r.rewrite("doc.price > 10", Coordinate::new(0, 2)),
            "doc_0_2.price > 10"
        );
    }

    #[test]
    fn rewrites_every_occurrence() {
        let r = rewriter();
        assert_eq!(
            r.rewrite("doc.a == doc.b && LENGTH(doc.c) > 0", Coordinate::new(1, 0)),
            "doc_1_0.a == doc_1_0.b && LENGTH(doc_1_0.c) > 0"
        );
    }

    #[test]
    fn rewrites_coordinate_suffixed_forms() {
        let r = rewriter();
        assert_eq!(
            r.rewrite("doc_0_3.name", Coordinate::new(2, 1)),
            "doc_2_1.name"
        );
    }

    #[test]
    fn leaves_longer_identifiers_alone() {
        let r = rewriter();
        let c = Coordinate::new(0, 0);
        assert_eq!(r.rewrite("docs.length", c), "docs.length");
        assert_eq!(r.rewrite("mydoc.x", c), "mydoc.x");
        assert_eq!(r.rewrite("doc_count", c), "doc_count");
        assert_eq!(r.rewrite("doc_0_1_x", c), "doc_0_1_x");
    }

    #[test]
    fn leaves_attribute_named_like_placeholder() {
        let r = rewriter();
        assert_eq!(
            r.rewrite("doc.doc == 1", Coordinate::new(0, 1)),
            "doc_0_1.doc == 1"
        );
    }

    #[test]
    fn handles_adjacent_operators() {
        let r = rewriter();
        assert_eq!(
            r.rewrite("(doc)==doc", Coordinate::new(0, 0)),
            "(doc_0_0)==doc_0_0"
        );
    }

    #[test]
    fn custom_placeholder() {
        let r = PlaceholderRewriter::new("item").unwrap();
        assert_eq!(
            r.rewrite("item.qty * 2 + doc.qty", Coordinate::new(0, 0)),
            "item_0_0.qty * 2 + doc.qty"
        );
    }
}
