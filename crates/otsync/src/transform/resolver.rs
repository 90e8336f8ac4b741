use tracing::debug;

use super::transform;
use crate::protocol::operation::overlaps;
use crate::protocol::Operation;

/// Rebases a queue of unacknowledged local operations over remote ones
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Transform every local op against `remote`, dropping cancelled ones
    pub fn resolve(&self, local: Vec<Operation>, remote: &Operation) -> Vec<Operation> {
        let before = local.len();
        let resolved: Vec<Operation> = local
            .into_iter()
            .filter_map(|op| transform(&op, remote).into_operation())
            .collect();

        if resolved.len() != before {
            debug!(
                "Remote op cancelled {} of {} local ops",
                before - resolved.len(),
                before
            );
        }
        resolved
    }

    /// Resolve against a batch of remote ops, in order
    pub fn resolve_all(&self, local: Vec<Operation>, remote: &[Operation]) -> Vec<Operation> {
        remote
            .iter()
            .fold(local, |local, op| self.resolve(local, op))
    }
}

/// Collapse repeated replaces of one path into a single replace.
///
/// The merged op keeps the first `old_value` and the last `value`, at the
/// position of the first replace. A replace is only folded into an earlier
/// one when no op in between touches an overlapping path.
pub fn merge_operations(ops: Vec<Operation>) -> Vec<Operation> {
    let mut merged: Vec<Operation> = Vec::with_capacity(ops.len());

    for op in ops {
        let Operation::Replace { path, value, .. } = &op else {
            merged.push(op);
            continue;
        };

        let target = merged.iter_mut().rev().find(|earlier| {
            overlaps(earlier.path(), path) || matches!(earlier, Operation::Move { from, .. } if overlaps(from, path))
        });

        match target {
            Some(Operation::Replace {
                path: earlier_path,
                value: earlier_value,
                ..
            }) if earlier_path == path => {
                *earlier_value = value.clone();
            }
            _ => merged.push(op),
        }
    }

    merged
}
