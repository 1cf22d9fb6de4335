//! Macro expansion.
//!
//! The expander is a small tree-walking interpreter that runs at compile
//! time. `(defmacro name (params…) body)` forms are consumed into a
//! registry; every other top-level form is expanded bottom-up, replacing
//! macro calls with the result of evaluating the macro body in an
//! environment binding the (already expanded, unevaluated) arguments.
//!
//! The evaluator understands just enough Lisp to write useful macros:
//! `first`/`rest`, `if`, `assign`, `list`, `quote`, `backquote` with
//! `unquote`, `cons`, the binary operator table, and calls to other
//! macros. Calling an ordinary function at expansion time is not
//! supported and fails with a diagnostic.

use crate::ast::SExpr;
use crate::error::CompileError;
use crate::optimizer::{eval_binop, is_binop};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct MacroDef {
    params: Vec<String>,
    body: SExpr,
}

/// Environment for one macro-body evaluation. Shallow-copied on nested
/// macro calls so inner bindings never leak outward.
type MacroEnv = HashMap<String, SExpr>;

#[derive(Debug, Default)]
pub struct MacroExpander {
    macros: HashMap<String, MacroDef>,
}

impl MacroExpander {
    pub fn new() -> Self {
        MacroExpander {
            macros: HashMap::new(),
        }
    }

    /// Consume `defmacro` forms and expand everything else. The returned
    /// program contains no macro definitions and no macro calls.
    pub fn expand_program(&mut self, program: &[SExpr]) -> Result<Vec<SExpr>, CompileError> {
        let mut expanded = Vec::new();
        for statement in program {
            if statement.is_form("defmacro") {
                self.define_macro(statement)?;
            } else {
                expanded.push(self.expand_recursive(statement)?);
            }
        }
        debug!(macros = self.macros.len(), forms = expanded.len(), "macro expansion complete");
        Ok(expanded)
    }

    fn define_macro(&mut self, statement: &SExpr) -> Result<(), CompileError> {
        let items = statement.as_list().unwrap_or_default();
        let (name, params, body) = match items {
            [_, SExpr::Symbol(name), SExpr::List(params), body] => (name, params, body),
            _ => return Err(CompileError::Macro("malformed defmacro".to_string())),
        };
        let params = params
            .iter()
            .map(|p| {
                p.as_symbol()
                    .map(str::to_string)
                    .ok_or_else(|| CompileError::Macro(format!("bad parameter list for macro '{}'", name)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.macros.insert(
            name.clone(),
            MacroDef {
                params,
                body: body.clone(),
            },
        );
        Ok(())
    }

    fn expand_recursive(&self, statement: &SExpr) -> Result<SExpr, CompileError> {
        let items = match statement.as_list() {
            Some(items) if !items.is_empty() => items,
            _ => return Ok(statement.clone()),
        };

        if let Some(def) = items[0].as_symbol().and_then(|n| self.macros.get(n)) {
            let args = &items[1..];
            if def.params.len() != args.len() {
                // Non-fatal: proceed with zip truncation, as the original
                // macro processor always has.
                println!(
                    "warning: macro expansion of {} has the wrong number of arguments (expected {}, got {})",
                    items[0], def.params.len(), args.len()
                );
            }
            let mut env: MacroEnv = HashMap::new();
            for (name, value) in def.params.iter().zip(args.iter()) {
                env.insert(name.clone(), self.expand_recursive(value)?);
            }
            return self.eval(&def.body, &mut env);
        }

        items.iter().map(|term| self.expand_recursive(term)).collect::<Result<Vec<_>, _>>().map(SExpr::List)
    }

    fn eval(&self, expr: &SExpr, env: &mut MacroEnv) -> Result<SExpr, CompileError> {
        let items = match expr {
            SExpr::Integer(_) | SExpr::Str(_) => return Ok(expr.clone()),
            SExpr::Symbol(name) => {
                return env.get(name).cloned().ok_or_else(|| {
                    CompileError::Macro(format!("undefined symbol '{}' during macro expansion", name))
                });
            }
            SExpr::List(items) if items.is_empty() => return Ok(expr.clone()),
            SExpr::List(items) => items,
        };

        let head = match items[0].as_symbol() {
            Some(name) => name,
            None => {
                return Err(CompileError::Macro(format!(
                    "bad function call during macro expansion: {}",
                    expr
                )));
            }
        };
        let args = &items[1..];

        match head {
            "first" => self.eval_element(args, env, 0),
            "rest" => self.eval_element(args, env, 1),
            "if" => {
                let cond = self.eval(self.arg(args, 0, "if")?, env)?;
                if truthy(&cond) {
                    self.eval(self.arg(args, 1, "if")?, env)
                } else if args.len() > 2 {
                    self.eval(&args[2], env)
                } else {
                    Ok(SExpr::Integer(0))
                }
            }
            "assign" => {
                let name = self
                    .arg(args, 0, "assign")?
                    .as_symbol()
                    .ok_or_else(|| CompileError::Macro("assign needs a symbol".to_string()))?
                    .to_string();
                let value = self.eval(self.arg(args, 1, "assign")?, env)?;
                env.insert(name, value.clone());
                Ok(value)
            }
            "list" => args
                .iter()
                .map(|e| self.eval(e, env))
                .collect::<Result<Vec<_>, _>>()
                .map(SExpr::List),
            "quote" => Ok(self.arg(args, 0, "quote")?.clone()),
            "backquote" => self.expand_backquote(self.arg(args, 0, "backquote")?, env),
            "cons" => {
                let first = self.eval(self.arg(args, 0, "cons")?, env)?;
                let rest = self.eval(self.arg(args, 1, "cons")?, env)?;
                Ok(SExpr::List(vec![first, rest]))
            }
            _ if is_binop(head) && args.len() == 2 => {
                let a = self.eval_integer(&args[0], env, head)?;
                let b = self.eval_integer(&args[1], env, head)?;
                eval_binop(head, a, b).map(SExpr::Integer).ok_or_else(|| {
                    CompileError::Macro(format!("arithmetic error evaluating ({} {} {})", head, a, b))
                })
            }
            _ if self.macros.contains_key(head) => {
                // A macro calling a macro: fresh shallow copy of the
                // environment, arguments bound unevaluated.
                let def = self.macros[head].clone();
                let mut inner_env = env.clone();
                for (name, value) in def.params.iter().zip(args.iter()) {
                    inner_env.insert(name.clone(), value.clone());
                }
                self.eval(&def.body, &mut inner_env)
            }
            _ => {
                // Expansion-time user function calls have never been
                // supported; fail loudly rather than guess.
                Err(CompileError::Macro(format!(
                    "bad function call during macro expansion: {}",
                    expr
                )))
            }
        }
    }

    fn arg<'a>(&self, args: &'a [SExpr], index: usize, form: &str) -> Result<&'a SExpr, CompileError> {
        args.get(index)
            .ok_or_else(|| CompileError::Macro(format!("wrong number of arguments for {} in macro body", form)))
    }

    fn eval_element(&self, args: &[SExpr], env: &mut MacroEnv, index: usize) -> Result<SExpr, CompileError> {
        let form = if index == 0 { "first" } else { "rest" };
        let value = self.eval(self.arg(args, 0, form)?, env)?;
        let items = value
            .as_list()
            .ok_or_else(|| CompileError::Macro(format!("{} applied to a non-list in macro body", form)))?;
        items
            .get(index)
            .cloned()
            .ok_or_else(|| CompileError::Macro(format!("{} applied to a list that is too short", form)))
    }

    fn eval_integer(&self, expr: &SExpr, env: &mut MacroEnv, op: &str) -> Result<i32, CompileError> {
        self.eval(expr, env)?.as_integer().ok_or_else(|| {
            CompileError::Macro(format!("non-integer operand for '{}' during macro expansion", op))
        })
    }

    fn expand_backquote(&self, expr: &SExpr, env: &mut MacroEnv) -> Result<SExpr, CompileError> {
        let items = match expr.as_list() {
            Some(items) if !items.is_empty() => items,
            _ => return Ok(expr.clone()),
        };
        if expr.is_form("unquote") {
            return self.eval(self.arg(&items[1..], 0, "unquote")?, env);
        }
        items
            .iter()
            .map(|term| self.expand_backquote(term, env))
            .collect::<Result<Vec<_>, _>>()
            .map(SExpr::List)
    }
}

fn truthy(expr: &SExpr) -> bool {
    match expr {
        SExpr::Integer(v) => *v != 0,
        SExpr::List(items) => !items.is_empty(),
        SExpr::Str(s) => !s.is_empty(),
        SExpr::Symbol(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn expand(source: &str) -> Vec<SExpr> {
        let mut parser = Parser::new();
        parser.parse_source(source).unwrap();
        let mut expander = MacroExpander::new();
        expander.expand_program(&parser.into_program()).unwrap()
    }

    #[test]
    fn test_defmacro_forms_are_consumed() {
        let program = expand("(defmacro noop (x) `,x) (+ 1 2)");
        assert_eq!(program.len(), 1);
        assert_eq!(program[0].to_string(), "(+ 1 2)");
    }

    #[test]
    fn test_when_macro() {
        let program = expand("(defmacro when (c b) `(if ,c ,b 0)) (when (= 1 1) (printdec 42))");
        assert_eq!(program.len(), 1);
        assert_eq!(program[0].to_string(), "(if (= 1 1) (printdec 42) 0)");
    }

    #[test]
    fn test_backquote_splices_only_unquotes() {
        let program = expand("(defmacro m (a) `(f ,a (g b) 3)) (m (+ 1 x))");
        assert_eq!(program[0].to_string(), "(f (+ 1 x) (g b) 3)");
    }

    #[test]
    fn test_macro_arguments_are_expanded_first() {
        let program = expand(
            "(defmacro inc (x) `(+ ,x 1)) (defmacro twice (x) `(* ,x 2)) (twice (inc y))",
        );
        assert_eq!(program[0].to_string(), "(* (+ y 1) 2)");
    }

    #[test]
    fn test_macro_calling_macro_in_body() {
        let program = expand(
            "(defmacro inc (x) `(+ ,x 1)) (defmacro incinc (y) (inc (inc y))) (incinc q)",
        );
        // Body evaluation invokes `inc` as a sub-macro with a copied env.
        // Sub-macro arguments bind unevaluated, so the inner call is
        // spliced in as-is rather than expanded again.
        assert_eq!(program[0].to_string(), "(+ (inc y) 1)");
    }

    #[test]
    fn test_expansion_inside_nested_forms() {
        let program = expand("(defmacro when (c b) `(if ,c ,b 0)) (function main () (when 1 2))");
        assert_eq!(program[0].to_string(), "(function main () (if 1 2 0))");
    }

    #[test]
    fn test_argument_count_mismatch_truncates() {
        // Extra argument is dropped; expansion still succeeds.
        let program = expand("(defmacro fst (a) `,a) (fst 1 2)");
        assert_eq!(program[0].to_string(), "1");
    }

    #[test]
    fn test_first_rest_are_indexed_access() {
        let program = expand("(defmacro hd (l) (first (quote (a b c)))) (hd 0)");
        assert_eq!(program[0].to_string(), "a");
        // rest is literal index-1 access, preserving the pair quirk
        let program = expand("(defmacro tl (l) (rest (quote (a b c)))) (tl 0)");
        assert_eq!(program[0].to_string(), "b");
    }

    #[test]
    fn test_cons_builds_a_pair() {
        let program = expand("(defmacro p () (cons 1 (quote (2 3)))) (p)");
        assert_eq!(program[0].to_string(), "(1 (2 3))");
    }

    #[test]
    fn test_binops_evaluate_in_macro_bodies() {
        let program = expand("(defmacro double (x) (* 2 x)) (double 21)");
        assert_eq!(program[0].to_string(), "42");
    }

    #[test]
    fn test_assign_and_if_in_macro_body() {
        let program = expand(
            "(defmacro pick (n) (if (> n 5) (quote big) (quote small))) (pick 9) (pick 2)",
        );
        assert_eq!(program[0].to_string(), "big");
        assert_eq!(program[1].to_string(), "small");
    }

    #[test]
    fn test_missing_else_yields_zero() {
        let program = expand("(defmacro m (n) (if (> n 5) 1)) (m 2)");
        assert_eq!(program[0].to_string(), "0");
    }

    #[test]
    fn test_user_function_call_is_a_diagnostic() {
        let mut parser = Parser::new();
        parser
            .parse_source("(defmacro m (x) (frobnicate x)) (m 1)")
            .unwrap();
        let mut expander = MacroExpander::new();
        let err = expander.expand_program(&parser.into_program()).unwrap_err();
        assert!(err.to_string().contains("bad function call during macro expansion"));
    }

    #[test]
    fn test_undefined_symbol_is_a_diagnostic() {
        let mut parser = Parser::new();
        parser.parse_source("(defmacro m () `,y) (m)").unwrap();
        let mut expander = MacroExpander::new();
        let err = expander.expand_program(&parser.into_program()).unwrap_err();
        assert!(err.to_string().contains("undefined symbol"));
    }
}
