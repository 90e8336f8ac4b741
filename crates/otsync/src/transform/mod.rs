//! Operation transform for the client's in-flight queue.
//!
//! `transform(a, b)` answers: how must `a` change if `b` has already been
//! applied to the state `a` was built against? The rules are deliberately
//! narrow. Concurrent writes to the same leaf are last-write-wins at the
//! server; the transform only keeps the local queue consistent with what the
//! server will have seen.

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::protocol::operation::{is_ancestor, Operation};

mod resolver;

pub use resolver::{merge_operations, ConflictResolver};

/// Result of transforming one operation against another
#[derive(Debug, Clone, PartialEq)]
pub enum Transformed {
    /// No adjustment needed
    Unchanged(Operation),
    /// The operation was rewritten to stay valid
    Rebased(Operation),
    /// The operation no longer has an effect and should be dropped.
    /// Carries the original for diagnostics.
    Cancelled(Operation),
}

impl Transformed {
    /// The resulting operation (the original one when cancelled)
    pub fn operation(&self) -> &Operation {
        match self {
            Transformed::Unchanged(op) | Transformed::Rebased(op) | Transformed::Cancelled(op) => {
                op
            }
        }
    }

    /// True unless the operation passed through untouched
    pub fn is_transformed(&self) -> bool {
        !matches!(self, Transformed::Unchanged(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Transformed::Cancelled(_))
    }

    /// The operation to keep, or `None` if it was cancelled
    pub fn into_operation(self) -> Option<Operation> {
        match self {
            Transformed::Unchanged(op) | Transformed::Rebased(op) => Some(op),
            Transformed::Cancelled(_) => None,
        }
    }
}

/// Adjust `a` assuming `b` was applied first to the same prior state
pub fn transform(a: &Operation, b: &Operation) -> Transformed {
    match (a, b) {
        // First writer wins; the later insert is the caller's to reject.
        (Operation::Insert { path: pa, .. }, Operation::Insert { path: pb, .. }) if pa == pb => {
            Transformed::Unchanged(a.clone())
        }

        (Operation::Insert { path: pa, .. }, Operation::Delete { path: pb, .. })
            if is_ancestor(pb, pa) =>
        {
            debug!("Insert under deleted subtree cancelled");
            Transformed::Cancelled(a.clone())
        }

        (Operation::Delete { path: pa, .. }, Operation::Delete { path: pb, .. }) if pa == pb => {
            Transformed::Cancelled(a.clone())
        }

        (
            Operation::Delete {
                path: pa,
                old_value,
            },
            Operation::Insert {
                path: pb,
                value: inserted,
            },
        ) if is_ancestor(pa, pb) => {
            let relative = pb[pa.len()..].to_vec();
            let widened = with_value_at(old_value, relative, inserted);
            Transformed::Rebased(Operation::delete(pa.clone(), widened))
        }

        (
            Operation::Replace { path: pa, value, .. },
            Operation::Replace {
                path: pb,
                value: applied,
                ..
            },
        ) if pa == pb => Transformed::Rebased(Operation::replace(
            pa.clone(),
            value.clone(),
            applied.clone(),
        )),

        _ => Transformed::Unchanged(a.clone()),
    }
}

/// `base` with `value` written at the relative path, created or overwritten
fn with_value_at(
    base: &JsonValue,
    relative: crate::protocol::Path,
    value: &JsonValue,
) -> JsonValue {
    let mut widened = base.clone();
    let written = Operation::insert(relative.clone(), value.clone())
        .apply_to(&mut widened)
        .or_else(|_| {
            Operation::replace(relative, value.clone(), JsonValue::Null).apply_to(&mut widened)
        });

    if let Err(e) = written {
        debug!("Could not widen delete old value: {}", e);
    }
    widened
}
