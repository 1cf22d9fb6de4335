//! S-expression values.
//!
//! The whole front end works on one recursive type: an atom (integer,
//! symbol or string literal) or an ordered sequence of values. The empty
//! sequence doubles as nil. Trees are immutable once the reader produces
//! them; every later stage builds new trees.

use std::fmt;

/// A single S-expression node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SExpr {
    Integer(i32),
    Symbol(String),
    Str(String),
    List(Vec<SExpr>),
}

impl SExpr {
    pub fn symbol(name: &str) -> SExpr {
        SExpr::Symbol(name.to_string())
    }

    pub fn list(items: Vec<SExpr>) -> SExpr {
        SExpr::List(items)
    }

    /// The empty list, which is also nil.
    pub fn nil() -> SExpr {
        SExpr::List(Vec::new())
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            SExpr::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i32> {
        match self {
            SExpr::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[SExpr]> {
        match self {
            SExpr::List(items) => Some(items),
            _ => None,
        }
    }

    /// The head symbol of a non-empty list form, if there is one.
    pub fn head_symbol(&self) -> Option<&str> {
        self.as_list().and_then(|items| items.first()).and_then(|h| h.as_symbol())
    }

    /// True for a list form `(name …)`.
    pub fn is_form(&self, name: &str) -> bool {
        self.head_symbol() == Some(name)
    }
}

impl fmt::Display for SExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SExpr::Integer(v) => write!(f, "{}", v),
            SExpr::Symbol(s) => write!(f, "{}", s),
            SExpr::Str(s) => write!(f, "\"{}\"", s),
            SExpr::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}
