use crate::exec;
use crate::parser::{ControlOp, Pipeline};
use crate::shell::Shell;

/// Runs an ordered list of pipelines left to right, honoring `&&`/`||`
/// short-circuiting. Background pipelines contribute a success status and
/// never block.
pub fn run_list(shell: &mut Shell, pipelines: &[Pipeline]) -> i32 {
    let mut status = shell.last_status;
    let mut prev_op = ControlOp::None;

    for pipeline in pipelines {
        if should_run(prev_op, status) {
            let mut pipeline = pipeline.clone();
            for stage in &mut pipeline.stages {
                shell.expand_alias(stage);
            }
            status = exec::run_pipeline(shell, &pipeline);
            shell.last_status = status;
        }
        prev_op = pipeline.op;
        if shell.exit.is_some() {
            break;
        }
    }
    status
}

/// The short-circuit rule: `&&` requires the previous pipeline to have
/// succeeded, `||` requires it to have failed.
fn should_run(prev_op: ControlOp, last_status: i32) -> bool {
    match prev_op {
        ControlOp::None | ControlOp::Sequence => true,
        ControlOp::And => last_status == 0,
        ControlOp::Or => last_status != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_circuit_rule() {
        assert!(should_run(ControlOp::None, 0));
        assert!(should_run(ControlOp::None, 1));
        assert!(should_run(ControlOp::Sequence, 127));
        assert!(should_run(ControlOp::And, 0));
        assert!(!should_run(ControlOp::And, 1));
        assert!(should_run(ControlOp::Or, 1));
        assert!(!should_run(ControlOp::Or, 0));
    }
}
