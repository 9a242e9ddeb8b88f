//! Condition AST and the bottom-up optimizer that folds comparisons into
//! ranges, detects contradictions, and orders branches cheapest-first.

use crate::schema::{self, FieldType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

#[derive(Debug, Clone)]
pub enum Condition {
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Compare(String, CompareOp, Vec<u8>),
    /// `[lower, upper)` over `column`; `upper == None` means unbounded
    /// above. An exclusive `Some(upper)` built from `schema::next` of the
    /// domain maximum would be indistinguishable from the maximum itself
    /// (the encodings saturate there), so "no upper bound" has to be its
    /// own state rather than a sentinel byte string.
    Range(String, Vec<u8>, Option<Vec<u8>>),
    False,
}

impl Condition {
    /// Evaluates this condition against a row, looking up column slices
    /// through `schema`.
    pub fn eval(&self, schema: &crate::schema::Schema, row: &[u8]) -> bool {
        match self {
            Condition::And(a, b) => a.eval(schema, row) && b.eval(schema, row),
            Condition::Or(a, b) => a.eval(schema, row) || b.eval(schema, row),
            Condition::False => false,
            Condition::Compare(col, op, literal) => {
                let Some(slice) = field_slice(schema, col, row) else { return false };
                let ord = slice.cmp(literal.as_slice());
                match op {
                    CompareOp::Eq => ord.is_eq(),
                    CompareOp::Ne => !ord.is_eq(),
                    CompareOp::Ge => ord.is_ge(),
                    CompareOp::Le => ord.is_le(),
                    CompareOp::Gt => ord.is_gt(),
                    CompareOp::Lt => ord.is_lt(),
                }
            }
            Condition::Range(col, lower, upper) => {
                let Some(slice) = field_slice(schema, col, row) else { return false };
                slice >= lower.as_slice() && upper.as_deref().map(|u| slice < u).unwrap_or(true)
            }
        }
    }

    /// Complexity count: `Compare`/`Range` contribute 1, `And`/`Or` sum
    /// their children, `False` contributes 0. Used to order branches and
    /// to estimate evaluation cost.
    pub fn complexity(&self) -> u32 {
        match self {
            Condition::And(a, b) | Condition::Or(a, b) => a.complexity() + b.complexity(),
            Condition::Compare(..) | Condition::Range(..) => 1,
            Condition::False => 0,
        }
    }

    pub fn column_of_simple(&self) -> Option<&str> {
        match self {
            Condition::Compare(c, ..) | Condition::Range(c, ..) => Some(c.as_str()),
            _ => None,
        }
    }
}

fn field_slice<'a>(schema: &crate::schema::Schema, col: &str, row: &'a [u8]) -> Option<&'a [u8]> {
    let field = schema.field(col)?;
    let offset = schema.offset_of(col)?;
    Some(&row[offset..offset + field.width()])
}

/// Optimizes a condition tree bottom-up. Returns the rewritten tree;
/// `Condition::complexity` on the result gives its coarse cost.
pub fn optimize(cond: Condition, field_types: &dyn Fn(&str) -> (FieldType, u32)) -> Condition {
    match cond {
        Condition::And(a, b) => {
            let a = optimize(*a, field_types);
            let b = optimize(*b, field_types);
            combine_and(a, b, field_types)
        }
        Condition::Or(a, b) => {
            let a = optimize(*a, field_types);
            let b = optimize(*b, field_types);
            combine_or(a, b)
        }
        Condition::Compare(col, op, literal) => rewrite_compare(col, op, literal, field_types),
        other => other,
    }
}

/// The exclusive upper bound one past `literal`, or `None` if `literal`
/// is already the domain maximum (there is no encoded value past it —
/// `schema::next` would just saturate back to `literal` itself).
fn exclusive_upper_after(ty: FieldType, len: u32, literal: &[u8]) -> Option<Vec<u8>> {
    if literal == schema::max_limit(ty, len).as_slice() {
        None
    } else {
        schema::next(ty, literal).ok()
    }
}

fn rewrite_compare(col: String, op: CompareOp, literal: Vec<u8>, field_types: &dyn Fn(&str) -> (FieldType, u32)) -> Condition {
    let (ty, len) = field_types(&col);
    match op {
        CompareOp::Lt => Condition::Range(col, schema::min_limit(ty, len), Some(literal)),
        CompareOp::Le => {
            let upper = exclusive_upper_after(ty, len, &literal);
            Condition::Range(col, schema::min_limit(ty, len), upper)
        }
        CompareOp::Gt => {
            if literal == schema::max_limit(ty, len) {
                return Condition::False; // nothing sorts past the domain maximum
            }
            let lower = schema::next(ty, &literal).unwrap_or(literal);
            Condition::Range(col, lower, None)
        }
        CompareOp::Ge => Condition::Range(col, literal, None),
        CompareOp::Eq | CompareOp::Ne => Condition::Compare(col, op, literal),
    }
}

fn combine_and(a: Condition, b: Condition, field_types: &dyn Fn(&str) -> (FieldType, u32)) -> Condition {
    if matches!(a, Condition::False) || matches!(b, Condition::False) {
        return Condition::False;
    }

    if let (Condition::Range(ca, la, ua), Condition::Range(cb, lb, ub)) = (&a, &b) {
        if ca == cb {
            let lower = if la > lb { la.clone() } else { lb.clone() };
            let upper = narrower_upper(ua, ub);
            if let Some(u) = &upper {
                if &lower >= u {
                    return Condition::False;
                }
            }
            return Condition::Range(ca.clone(), lower, upper);
        }
    }

    if let (Condition::Range(rc, rl, ru), Condition::Compare(cc, CompareOp::Eq, lit))
        | (Condition::Compare(cc, CompareOp::Eq, lit), Condition::Range(rc, rl, ru)) = (&a, &b)
    {
        if rc == cc {
            let under_upper = ru.as_deref().map(|u| lit < u).unwrap_or(true);
            if lit >= rl && under_upper {
                return Condition::Range(rc.clone(), rl.clone(), ru.clone());
            }
            return Condition::False;
        }
    }
    let _ = field_types;

    sort_cheapest_first(Condition::And(Box::new(a), Box::new(b)))
}

fn combine_or(a: Condition, b: Condition) -> Condition {
    match (&a, &b) {
        (Condition::False, _) => return b,
        (_, Condition::False) => return a,
        _ => {}
    }

    if let (Condition::Range(ca, la, ua), Condition::Range(cb, lb, ub)) = (&a, &b) {
        if ca == cb && ranges_overlap(la, ua, lb, ub) {
            let lower = if la < lb { la.clone() } else { lb.clone() };
            let upper = wider_upper(ua, ub);
            return Condition::Range(ca.clone(), lower, upper);
        }
    }

    sort_cheapest_first(Condition::Or(Box::new(a), Box::new(b)))
}

/// The tighter of two (possibly unbounded) exclusive upper bounds.
fn narrower_upper(ua: &Option<Vec<u8>>, ub: &Option<Vec<u8>>) -> Option<Vec<u8>> {
    match (ua, ub) {
        (None, None) => None,
        (Some(x), None) | (None, Some(x)) => Some(x.clone()),
        (Some(x), Some(y)) => Some(if x < y { x.clone() } else { y.clone() }),
    }
}

/// The looser of two (possibly unbounded) exclusive upper bounds.
fn wider_upper(ua: &Option<Vec<u8>>, ub: &Option<Vec<u8>>) -> Option<Vec<u8>> {
    match (ua, ub) {
        (None, _) | (_, None) => None,
        (Some(x), Some(y)) => Some(if x > y { x.clone() } else { y.clone() }),
    }
}

fn ranges_overlap(la: &[u8], ua: &Option<Vec<u8>>, lb: &[u8], ub: &Option<Vec<u8>>) -> bool {
    let a_before_b_end = ub.as_deref().map(|u| la < u).unwrap_or(true);
    let b_before_a_end = ua.as_deref().map(|u| lb < u).unwrap_or(true);
    a_before_b_end && b_before_a_end
}

fn sort_cheapest_first(cond: Condition) -> Condition {
    match cond {
        Condition::And(a, b) => {
            if a.complexity() <= b.complexity() {
                Condition::And(a, b)
            } else {
                Condition::And(b, a)
            }
        }
        Condition::Or(a, b) => {
            if a.complexity() <= b.complexity() {
                Condition::Or(a, b)
            } else {
                Condition::Or(b, a)
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(_col: &str) -> (FieldType, u32) {
        (FieldType::Integer, 4)
    }

    #[test]
    fn and_of_false_is_false() {
        let c = Condition::And(Box::new(Condition::False), Box::new(Condition::Compare("x".into(), CompareOp::Eq, vec![0; 4])));
        assert!(matches!(optimize(c, &types), Condition::False));
    }

    #[test]
    fn or_absorbs_false() {
        let cmp = Condition::Compare("x".into(), CompareOp::Eq, 1i32.to_le_bytes().to_vec());
        let c = Condition::Or(Box::new(Condition::False), Box::new(cmp.clone()));
        let result = optimize(c, &types);
        assert!(matches!(result, Condition::Compare(..)));
    }

    #[test]
    fn less_than_rewrites_to_a_range() {
        let c = Condition::Compare("x".into(), CompareOp::Lt, 10i32.to_le_bytes().to_vec());
        let result = optimize(c, &types);
        assert!(matches!(result, Condition::Range(..)));
    }

    #[test]
    fn contradictory_ranges_collapse_to_false() {
        let a = Condition::Range("x".into(), 10i32.to_le_bytes().to_vec(), Some(20i32.to_le_bytes().to_vec()));
        let b = Condition::Range("x".into(), 30i32.to_le_bytes().to_vec(), Some(40i32.to_le_bytes().to_vec()));
        let result = optimize(Condition::And(Box::new(a), Box::new(b)), &types);
        assert!(matches!(result, Condition::False));
    }

    #[test]
    fn greater_than_domain_max_is_unsatisfiable() {
        let c = Condition::Compare("x".into(), CompareOp::Gt, schema::max_limit(FieldType::Integer, 4));
        assert!(matches!(optimize(c, &types), Condition::False));
    }

    #[test]
    fn greater_equal_includes_rows_equal_to_domain_max() {
        use crate::schema::Schema;
        let schema = Schema {
            fields: vec![crate::schema::Field { id: 0, name: "x".into(), ty: FieldType::Integer, length: 4 }],
            primary_id: 0,
        };
        let max = schema::max_limit(FieldType::Integer, 4);
        let c = Condition::Compare("x".into(), CompareOp::Ge, max.clone());
        let optimized = optimize(c, &types);
        assert!(optimized.eval(&schema, &max));
    }

    #[test]
    fn less_equal_includes_rows_equal_to_domain_max() {
        use crate::schema::Schema;
        let schema = Schema {
            fields: vec![crate::schema::Field { id: 0, name: "x".into(), ty: FieldType::Integer, length: 4 }],
            primary_id: 0,
        };
        let max = schema::max_limit(FieldType::Integer, 4);
        let c = Condition::Compare("x".into(), CompareOp::Le, max.clone());
        let optimized = optimize(c, &types);
        assert!(optimized.eval(&schema, &max));
    }

    #[test]
    fn complexity_counts_leaves() {
        let cond = Condition::And(
            Box::new(Condition::Compare("x".into(), CompareOp::Eq, vec![0; 4])),
            Box::new(Condition::Compare("y".into(), CompareOp::Eq, vec![0; 4])),
        );
        assert_eq!(cond.complexity(), 2);
    }
}
