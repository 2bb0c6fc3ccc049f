//! Evaluation of parsed condition expressions against a variable store.

use std::cmp::Ordering;

use ember_bundle_types::{BundleVersion, VariantValue, Variables};

use crate::{CompareKind, CompareOp, Expr, Operand};

pub(crate) fn evaluate_expr(expr: &Expr, variables: &Variables) -> bool {
    match expr {
        Expr::Or(left, right) => {
            evaluate_expr(left, variables) || evaluate_expr(right, variables)
        }
        Expr::And(left, right) => {
            evaluate_expr(left, variables) && evaluate_expr(right, variables)
        }
        Expr::Not(inner) => !evaluate_expr(inner, variables),
        Expr::Compare { op, left, right } => {
            let left = resolve(left, variables);
            let right = resolve(right, variables);
            compare_values(*op, left, right)
        }
        Expr::Truthy(operand) => truthy(&resolve(operand, variables)),
    }
}

fn resolve(operand: &Operand, variables: &Variables) -> VariantValue {
    match operand {
        Operand::Variable(name) => variables.get(name),
        Operand::Number(value) => VariantValue::Numeric(*value),
        Operand::Literal(text) => VariantValue::String(text.clone()),
        Operand::Version(version) => VariantValue::Version(*version),
    }
}

fn truthy(value: &VariantValue) -> bool {
    match value {
        VariantValue::None => false,
        VariantValue::Numeric(n) => *n != 0,
        VariantValue::Version(v) => v.to_qword() != 0,
        VariantValue::String(s) => !s.is_empty(),
    }
}

/// The outcome of a comparison whose operands cannot be brought to a common
/// type: everything is false except *not equal*.
fn not_equal_outcome(op: CompareOp) -> bool {
    op.kind == CompareKind::Ne
}

fn compare_values(op: CompareOp, left: VariantValue, right: VariantValue) -> bool {
    use VariantValue::{None, Numeric, String, Version};
    match (left, right) {
        (String(l), String(r)) => compare_strings(op, &l, &r),
        (Numeric(l), Numeric(r)) => compare_numerics(op, l, r),
        (Version(l), Version(r)) => compare_versions(op, l, r),

        // A version against a string parses the string; a version against a
        // numeric reinterprets the numeric as a packed quad. A string that
        // does not parse as a version compares not-equal.
        (Version(l), String(r)) => match r.parse::<BundleVersion>() {
            Ok(r) => compare_versions(op, l, r),
            Err(_) => not_equal_outcome(op),
        },
        (String(l), Version(r)) => match l.parse::<BundleVersion>() {
            Ok(l) => compare_versions(op, l, r),
            Err(_) => not_equal_outcome(op),
        },
        (Version(l), Numeric(r)) => compare_versions(op, l, BundleVersion::from_qword(r as u64)),
        (Numeric(l), Version(r)) => compare_versions(op, BundleVersion::from_qword(l as u64), r),

        // A numeric against a string parses the string as a number.
        (Numeric(l), String(r)) => match r.trim().parse::<i64>() {
            Ok(r) => compare_numerics(op, l, r),
            Err(_) => not_equal_outcome(op),
        },
        (String(l), Numeric(r)) => match l.trim().parse::<i64>() {
            Ok(l) => compare_numerics(op, l, r),
            Err(_) => not_equal_outcome(op),
        },

        (None, _) | (_, None) => not_equal_outcome(op),
    }
}

fn ordering_matches(kind: CompareKind, ordering: Ordering) -> bool {
    match kind {
        CompareKind::Lt => ordering == Ordering::Less,
        CompareKind::Gt => ordering == Ordering::Greater,
        CompareKind::Le => ordering != Ordering::Greater,
        CompareKind::Ge => ordering != Ordering::Less,
        CompareKind::Eq => ordering == Ordering::Equal,
        CompareKind::Ne => ordering != Ordering::Equal,
        CompareKind::Band | CompareKind::HiEq | CompareKind::LoEq => false,
    }
}

fn compare_strings(op: CompareOp, left: &str, right: &str) -> bool {
    let (left, right) = if op.insensitive {
        (left.to_lowercase(), right.to_lowercase())
    } else {
        (left.to_owned(), right.to_owned())
    };
    match op.kind {
        CompareKind::Band => left.contains(&right),
        CompareKind::HiEq => left.starts_with(&right),
        CompareKind::LoEq => left.ends_with(&right),
        kind => ordering_matches(kind, left.cmp(&right)),
    }
}

fn compare_numerics(op: CompareOp, left: i64, right: i64) -> bool {
    match op.kind {
        CompareKind::Band => (left & right) != 0,
        CompareKind::HiEq => ((left >> 16) & 0xFFFF) == right,
        CompareKind::LoEq => (left & 0xFFFF) == right,
        kind => ordering_matches(kind, left.cmp(&right)),
    }
}

fn compare_versions(op: CompareOp, left: BundleVersion, right: BundleVersion) -> bool {
    // The substring and 16-bit operators have no version interpretation.
    ordering_matches(op.kind, left.cmp(&right))
}
