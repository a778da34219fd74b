use crate::DegmlError;
use crate::ast::{Expression, Statement};

struct OpenScope {
    parent: Expression,
    target: u32,
    offset: u32,
    body: Vec<Statement>,
}

/// Folds every `pushenv`/`popenv` pair of a flat statement list into a
/// `Statement::Scoped` holding the statements between them.
pub fn reconcile(stmts: Vec<Statement>) -> Result<Vec<Statement>, DegmlError> {
    let mut top: Vec<Statement> = Vec::new();
    let mut open: Vec<OpenScope> = Vec::new();

    for s in stmts {
        let finished = match s {
            Statement::PushEnv { parent, target, offset } => {
                open.push(OpenScope { parent, target, offset, body: Vec::new() });
                continue;
            }
            Statement::PopEnv { offset, .. } => {
                let scope = open.pop().ok_or(DegmlError::UnbalancedScope { offset })?;
                Statement::Scoped { parent: scope.parent, target: scope.target, body: scope.body }
            }
            s => s,
        };
        match open.last_mut() {
            Some(scope) => scope.body.push(finished),
            None => top.push(finished),
        }
    }

    match open.last() {
        Some(scope) => Err(DegmlError::UnbalancedScope { offset: scope.offset }),
        None => Ok(top),
    }
}
