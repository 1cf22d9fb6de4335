//! Constant folding and strength reduction on S-expression trees.
//!
//! Runs bottom-up over each top-level form after macro expansion. `quote`
//! forms are opaque. Folded results wrap to the signed 16-bit range the
//! target machine's immediates and words use, so folding never produces a
//! value the program could not have computed at run time.

use crate::ast::SExpr;

/// Wrap a wide intermediate to a signed 16-bit value (low 16 bits,
/// sign-extended).
fn truncate16(v: i64) -> i32 {
    let w = (v & 0xffff) as i32;
    if w & 0x8000 != 0 { w - 0x10000 } else { w }
}

pub(crate) fn is_binop(name: &str) -> bool {
    matches!(
        name,
        "+" | "-"
            | "*"
            | "/"
            | "bitwise-and"
            | "bitwise-or"
            | "bitwise-xor"
            | "lshift"
            | "rshift"
            | ">"
            | ">="
            | "<"
            | "<="
            | "="
            | "<>"
    )
}

/// Apply a binary operator from the table. Returns `None` when the
/// operator is unknown or the divisor is zero; a zero divisor is left
/// for the runtime to trap.
pub(crate) fn eval_binop(name: &str, a: i32, b: i32) -> Option<i32> {
    let (a, b) = (a as i64, b as i64);
    let value = match name {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" => {
            if b == 0 {
                return None;
            }
            // Division rounds toward negative infinity, matching the
            // runtime's divide.
            let q = a / b;
            if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q }
        }
        "bitwise-and" => a & b,
        "bitwise-or" => a | b,
        "bitwise-xor" => a ^ b,
        // The shifter uses the low four bits of the count, like the
        // machine's barrel shifter, so folding is total.
        "lshift" => a << (b & 15),
        "rshift" => a >> (b & 15),
        ">" => (a > b) as i64,
        ">=" => (a >= b) as i64,
        "<" => (a < b) as i64,
        "<=" => (a <= b) as i64,
        "=" => (a == b) as i64,
        "<>" => (a != b) as i64,
        _ => return None,
    };
    Some(truncate16(value))
}

pub(crate) fn eval_unop(name: &str, a: i32) -> Option<i32> {
    match name {
        "bitwise-not" => Some(truncate16(!(a as i64))),
        "-" => Some(truncate16(-(a as i64))),
        "not" => Some(if a == 0 { 1 } else { 0 }),
        _ => None,
    }
}

/// Fold one tree bottom-up.
pub fn fold_constants(expr: &SExpr) -> SExpr {
    let items = match expr.as_list() {
        Some(items) if !items.is_empty() => items,
        _ => return expr.clone(),
    };

    if expr.is_form("quote") {
        return expr.clone();
    }

    let folded: Vec<SExpr> = items[1..].iter().map(fold_constants).collect();

    if let Some(name) = items[0].as_symbol() {
        // Arithmetic on fully constant arguments
        if folded.len() == 2 && is_binop(name) {
            if let (Some(a), Some(b)) = (folded[0].as_integer(), folded[1].as_integer()) {
                if let Some(value) = eval_binop(name, a, b) {
                    return SExpr::Integer(value);
                }
            }
        }

        if folded.len() == 1 {
            if let Some(a) = folded[0].as_integer() {
                if let Some(value) = eval_unop(name, a) {
                    return SExpr::Integer(value);
                }
            }
        }

        // Short-circuit evaluation on constants
        if (name == "and" || name == "or") && !folded.is_empty() {
            if let Some(value) = fold_boolean(name, &folded) {
                return value;
            }
        }

        // A constant condition selects its branch outright
        if name == "if" && (folded.len() == 2 || folded.len() == 3) {
            if let Some(c) = folded[0].as_integer() {
                return if c != 0 {
                    folded[1].clone()
                } else {
                    folded.get(2).cloned().unwrap_or(SExpr::Integer(0))
                };
            }
        }

        // Multiply/divide by a power of two becomes a shift
        if (name == "*" || name == "/") && folded.len() == 2 {
            if let Some(reduced) = reduce_strength(name, &folded) {
                return reduced;
            }
        }
    }

    let mut rebuilt = Vec::with_capacity(items.len());
    rebuilt.push(items[0].clone());
    rebuilt.extend(folded);
    SExpr::List(rebuilt)
}

fn fold_boolean(name: &str, args: &[SExpr]) -> Option<SExpr> {
    let constants: Vec<Option<i32>> = args.iter().map(|a| a.as_integer()).collect();
    if name == "and" {
        if constants.iter().any(|c| *c == Some(0)) {
            return Some(SExpr::Integer(0));
        }
        if constants.iter().all(|c| c.is_some()) {
            return Some(SExpr::Integer(1));
        }
    } else {
        if constants.iter().any(|c| matches!(c, Some(v) if *v != 0)) {
            return Some(SExpr::Integer(1));
        }
        if constants.iter().all(|c| c.is_some()) {
            return Some(SExpr::Integer(0));
        }
    }
    None
}

fn reduce_strength(name: &str, args: &[SExpr]) -> Option<SExpr> {
    let k = args[1].as_integer()?;
    if args[0].as_integer().is_some() {
        return None; // fully constant, the fold above already declined
    }
    if k == 1 {
        return Some(args[0].clone());
    }
    if k > 1 && (k & (k - 1)) == 0 {
        let shift = k.trailing_zeros() as i32;
        let op = if name == "*" { "lshift" } else { "rshift" };
        return Some(SExpr::list(vec![
            SExpr::symbol(op),
            args[0].clone(),
            SExpr::Integer(shift),
        ]));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn optimized(source: &str) -> String {
        let mut parser = Parser::new();
        parser.parse_source(source).unwrap();
        let program = parser.into_program();
        fold_constants(&program[0]).to_string()
    }

    #[test]
    fn test_binop_folding() {
        assert_eq!(optimized("(+ 2 3)"), "5");
        assert_eq!(optimized("(- 2 3)"), "-1");
        assert_eq!(optimized("(* 6 7)"), "42");
        assert_eq!(optimized("(/ 42 5)"), "8");
        assert_eq!(optimized("(bitwise-and 12 10)"), "8");
        assert_eq!(optimized("(bitwise-or 12 10)"), "14");
        assert_eq!(optimized("(bitwise-xor 12 10)"), "6");
        assert_eq!(optimized("(lshift 1 4)"), "16");
        assert_eq!(optimized("(rshift -16 2)"), "-4");
    }

    #[test]
    fn test_division_floors_toward_negative_infinity() {
        assert_eq!(optimized("(/ -7 2)"), "-4");
        assert_eq!(optimized("(/ 7 -2)"), "-4");
        assert_eq!(optimized("(/ -7 -2)"), "3");
        assert_eq!(optimized("(/ -8 2)"), "-4");
    }

    #[test]
    fn test_shift_count_uses_low_four_bits() {
        // counts wrap at the word width, so folding never declines
        assert_eq!(optimized("(lshift 1 16)"), "1");
        assert_eq!(optimized("(lshift 1 20)"), "16");
        assert_eq!(optimized("(lshift 1 15)"), "-32768");
        assert_eq!(optimized("(rshift -32768 -1)"), "-1");
        assert_eq!(optimized("(rshift 256 17)"), "128");
    }

    #[test]
    fn test_comparison_folding_yields_flags() {
        assert_eq!(optimized("(> 2 1)"), "1");
        assert_eq!(optimized("(>= 1 2)"), "0");
        assert_eq!(optimized("(< 1 2)"), "1");
        assert_eq!(optimized("(<= 2 1)"), "0");
        assert_eq!(optimized("(= 3 3)"), "1");
        assert_eq!(optimized("(<> 3 3)"), "0");
    }

    #[test]
    fn test_fold_wraps_to_16_bits() {
        assert_eq!(optimized("(* 256 256)"), "0");
        assert_eq!(optimized("(+ 32767 1)"), "-32768");
        assert_eq!(optimized("(- -32768 1)"), "32767");
        assert_eq!(optimized("(lshift 255 8)"), "-256");
    }

    #[test]
    fn test_division_by_zero_left_alone() {
        assert_eq!(optimized("(/ 1 0)"), "(/ 1 0)");
    }

    #[test]
    fn test_nested_folding() {
        assert_eq!(optimized("(+ (* 2 3) (- 10 4))"), "12");
        assert_eq!(optimized("(+ x (* 2 3))"), "(+ x 6)");
    }

    #[test]
    fn test_unary_folding() {
        assert_eq!(optimized("(- 5)"), "-5");
        assert_eq!(optimized("(bitwise-not 0)"), "-1");
        assert_eq!(optimized("(not 0)"), "1");
        assert_eq!(optimized("(not 7)"), "0");
    }

    #[test]
    fn test_and_or_short_circuit_folding() {
        assert_eq!(optimized("(and 1 0 x)"), "0");
        assert_eq!(optimized("(and 1 2 3)"), "1");
        assert_eq!(optimized("(and 1 x)"), "(and 1 x)");
        assert_eq!(optimized("(or 0 5)"), "1");
        assert_eq!(optimized("(or 0 0)"), "0");
        assert_eq!(optimized("(or 0 x)"), "(or 0 x)");
        // constant folding still applies inside the rebuilt form
        assert_eq!(optimized("(or x (= 1 2))"), "(or x 0)");
    }

    #[test]
    fn test_constant_if_pruning() {
        assert_eq!(optimized("(if 1 a b)"), "a");
        assert_eq!(optimized("(if 0 a b)"), "b");
        assert_eq!(optimized("(if (> 2 1) a b)"), "a");
        assert_eq!(optimized("(if 0 a)"), "0");
        assert_eq!(optimized("(if c a b)"), "(if c a b)");
    }

    #[test]
    fn test_strength_reduction() {
        assert_eq!(optimized("(* x 8)"), "(lshift x 3)");
        assert_eq!(optimized("(/ x 4)"), "(rshift x 2)");
        assert_eq!(optimized("(* x 1)"), "x");
        assert_eq!(optimized("(/ x 1)"), "x");
        assert_eq!(optimized("(* x 6)"), "(* x 6)");
        assert_eq!(optimized("(* x -8)"), "(* x -8)");
        // constant side on the left is not rewritten
        assert_eq!(optimized("(* 8 x)"), "(* 8 x)");
    }

    #[test]
    fn test_quote_is_opaque() {
        assert_eq!(optimized("(quote (+ 1 2))"), "(quote (+ 1 2))");
    }

    #[test]
    fn test_exhaustive_small_operand_sweep() {
        // optimize((op a b)) must equal truncate16(op(a, b)) for every op
        // in the table; only a zero divisor is left unfolded
        let ops = [
            "+", "-", "*", "/", "bitwise-and", "bitwise-or", "bitwise-xor", "lshift", "rshift",
            ">", ">=", "<", "<=", "=", "<>",
        ];
        for op in ops {
            for a in [-32768, -100, -7, -1, 0, 1, 77, 32767] {
                for b in [-32768, -3, 0, 2, 15, 17, 32767] {
                    let src = format!("({} {} {})", op, a, b);
                    let folded = optimized(&src);
                    match eval_binop(op, a, b) {
                        Some(expected) => assert_eq!(folded, expected.to_string(), "{}", src),
                        None => assert_eq!(folded, src, "{}", src),
                    }
                }
            }
        }
    }
}
