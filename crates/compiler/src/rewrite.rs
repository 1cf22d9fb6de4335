//! Compound accessor rewriting.
//!
//! Calls whose head matches `c[ad]+r` (`cadr`, `caddr`, `cadadr`, …) expand
//! into nested `first`/`rest` applications before macro expansion runs, so
//! the rest of the pipeline only ever sees the two primitive accessors.
//! The rightmost letter binds innermost: `(cadr x)` is `(first (rest x))`.

use crate::ast::SExpr;
use regex::Regex;
use std::sync::LazyLock;

static ACCESSOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^c([ad]+)r$").expect("accessor pattern"));

/// Rewrite one tree. `quote` forms are left untouched.
pub fn rewrite(expr: &SExpr) -> SExpr {
    let items = match expr.as_list() {
        Some(items) if !items.is_empty() => items,
        _ => return expr.clone(),
    };

    if expr.is_form("quote") {
        return expr.clone();
    }

    if let Some(head) = items[0].as_symbol() {
        if let Some(caps) = ACCESSOR.captures(head) {
            if items.len() == 2 {
                let mut inner = rewrite(&items[1]);
                for letter in caps[1].chars().rev() {
                    let accessor = if letter == 'a' { "first" } else { "rest" };
                    inner = SExpr::list(vec![SExpr::symbol(accessor), inner]);
                }
                return inner;
            }
        }
    }

    SExpr::List(items.iter().map(rewrite).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn rewritten(source: &str) -> String {
        let mut parser = Parser::new();
        parser.parse_source(source).unwrap();
        let program = parser.into_program();
        rewrite(&program[0]).to_string()
    }

    #[test]
    fn test_cadr_expands() {
        assert_eq!(rewritten("(cadr x)"), "(first (rest x))");
    }

    #[test]
    fn test_car_and_cdr_expand() {
        assert_eq!(rewritten("(car x)"), "(first x)");
        assert_eq!(rewritten("(cdr x)"), "(rest x)");
    }

    #[test]
    fn test_deep_accessor_order() {
        // cadadr = first of rest of first of rest
        assert_eq!(rewritten("(cadadr x)"), "(first (rest (first (rest x))))");
    }

    #[test]
    fn test_rewrites_inside_other_forms() {
        assert_eq!(
            rewritten("(if (caddr lst) 1 0)"),
            "(if (first (rest (rest lst))) 1 0)"
        );
    }

    #[test]
    fn test_argument_is_rewritten_too() {
        assert_eq!(rewritten("(cadr (cdr x))"), "(first (rest (rest x)))");
    }

    #[test]
    fn test_quote_is_opaque() {
        assert_eq!(rewritten("(quote (cadr x))"), "(quote (cadr x))");
        assert_eq!(rewritten("'(cadr x)"), "(quote (cadr x))");
    }

    #[test]
    fn test_non_accessor_names_pass_through() {
        assert_eq!(rewritten("(cabr x)"), "(cabr x)");
        assert_eq!(rewritten("(cr x)"), "(cr x)");
        assert_eq!(rewritten("(cadr x y)"), "(cadr x y)");
    }

    #[test]
    fn test_atoms_unchanged() {
        assert_eq!(rewritten("cadr"), "cadr");
        assert_eq!(rewritten("5"), "5");
    }
}
