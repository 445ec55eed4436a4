//! Condition Evaluator
//!
//! Decides a step gate from the captured output of the referenced step.
//! Evaluation reads a run snapshot only, so calling it twice on the same
//! snapshot gives the same answer.

use log::debug;

use crate::error::RunError;

use super::model::{CompareOp, Condition};
use super::state::{InstanceId, StepStatus, WorkflowRun};

/// Evaluates `condition` against the terminal output of its step.
///
/// A skipped step contributes an empty output. A failed step contributes
/// whatever it captured before failing. Trailing whitespace of the output
/// is ignored.
///
/// Fails with [`RunError::OutputNotReady`] if the referenced step is not
/// terminal yet.
pub fn evaluate(condition: &Condition, run: &WorkflowRun) -> Result<bool, RunError> {
    let id = InstanceId::step(condition.step.clone());
    let instance = run
        .instance(&id)
        .ok_or_else(|| RunError::UnknownInstance(id.to_string()))?;

    let output = match instance.status {
        StepStatus::Skipped => "",
        StepStatus::Succeeded | StepStatus::Failed => instance.output.as_deref().unwrap_or(""),
        StepStatus::Pending | StepStatus::Running => {
            return Err(RunError::OutputNotReady(condition.step.clone()));
        }
    };

    let equal = output.trim_end() == condition.value.as_text();
    let result = match condition.op {
        CompareOp::Eq => equal,
        CompareOp::Ne => !equal,
    };

    debug!(
        "Gate '{}' on output {:?}: {}",
        condition,
        output.trim_end(),
        result
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::Literal;
    use crate::workflow::state::{RunStateStore, TransitionDetails};
    use chrono::Utc;

    fn run_with(status: StepStatus, output: Option<&str>) -> WorkflowRun {
        let store = RunStateStore::new("r", "wf", vec![InstanceId::step("a")]);
        let a = InstanceId::step("a");
        let now = Utc::now();

        if status != StepStatus::Pending {
            let first = if status == StepStatus::Skipped {
                StepStatus::Skipped
            } else {
                StepStatus::Running
            };
            store
                .record_transition(&a, StepStatus::Pending, first, TransitionDetails::none(), now)
                .unwrap();
            if status.is_terminal() && first != status {
                let details = TransitionDetails {
                    output: output.map(str::to_string),
                    reason: None,
                };
                store
                    .record_transition(&a, StepStatus::Running, status, details, now)
                    .unwrap();
            }
        }
        store.snapshot().unwrap()
    }

    #[test]
    fn test_bool_output_with_newline() {
        let run = run_with(StepStatus::Succeeded, Some("true\n"));
        assert!(evaluate(&Condition::equals("a", Literal::Bool(true)), &run).unwrap());
        assert!(!evaluate(&Condition::equals("a", Literal::Bool(false)), &run).unwrap());
    }

    #[test]
    fn test_not_equals() {
        let run = run_with(StepStatus::Succeeded, Some("down"));
        let cond = Condition::not_equals("a", Literal::Text("up".into()));
        assert!(evaluate(&cond, &run).unwrap());
    }

    #[test]
    fn test_numeric_text_compared_exactly() {
        let run = run_with(StepStatus::Succeeded, Some("007\n"));
        let cond: Condition = "a == 007".parse().unwrap();
        assert!(evaluate(&cond, &run).unwrap());

        let cond: Condition = "a == 7".parse().unwrap();
        assert!(!evaluate(&cond, &run).unwrap());
    }

    #[test]
    fn test_leading_whitespace_is_significant() {
        let run = run_with(StepStatus::Succeeded, Some(" true"));
        assert!(!evaluate(&Condition::equals("a", Literal::Bool(true)), &run).unwrap());
    }

    #[test]
    fn test_skipped_reads_empty() {
        let run = run_with(StepStatus::Skipped, None);
        assert!(evaluate(&Condition::equals("a", Literal::Text(String::new())), &run).unwrap());
        assert!(!evaluate(&Condition::equals("a", Literal::Bool(true)), &run).unwrap());
    }

    #[test]
    fn test_failed_uses_captured_output() {
        let run = run_with(StepStatus::Failed, Some("partial"));
        assert!(evaluate(&Condition::equals("a", Literal::Text("partial".into())), &run).unwrap());
    }

    #[test]
    fn test_not_ready() {
        for status in [StepStatus::Pending, StepStatus::Running] {
            let run = run_with(status, None);
            let err = evaluate(&Condition::equals("a", Literal::Bool(true)), &run).unwrap_err();
            assert!(matches!(err, RunError::OutputNotReady(step) if step == "a"));
        }
    }

    #[test]
    fn test_unknown_step() {
        let run = run_with(StepStatus::Succeeded, Some("x"));
        let err = evaluate(&Condition::equals("zzz", Literal::Bool(true)), &run).unwrap_err();
        assert!(matches!(err, RunError::UnknownInstance(_)));
    }

    #[test]
    fn test_idempotent() {
        let run = run_with(StepStatus::Succeeded, Some("false"));
        let cond = Condition::equals("a", Literal::Bool(true));
        let first = evaluate(&cond, &run).unwrap();
        let second = evaluate(&cond, &run).unwrap();
        assert_eq!(first, second);
        assert!(!first);
    }
}
