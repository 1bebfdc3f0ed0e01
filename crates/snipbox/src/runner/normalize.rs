//! Turns every [`ExecutionResult`] into the text shown to the user

use std::time::Duration;

use crate::types::ExecutionResult;

pub const REJECTED_TEXT: &str = "Not supported";
pub const EMIT_EMPTY_TEXT: &str = "Incorrect data";
pub const NO_VALUE_TEXT: &str = "null";

/// Render `result` as display text; never returns an empty string
pub fn normalize(result: &ExecutionResult) -> String {
    let text = match result {
        ExecutionResult::Rejected => REJECTED_TEXT.to_string(),
        ExecutionResult::CompileError(diagnostics) => diagnostics
            .iter()
            .map(|diagnostic| diagnostic.message.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        ExecutionResult::EmitEmpty => EMIT_EMPTY_TEXT.to_string(),
        ExecutionResult::Timeout(deadline) => timeout_text(*deadline),
        ExecutionResult::RuntimeFault(message) => message.clone(),
        ExecutionResult::SupervisionFault(message) => format!("[Execution failed: {message}]"),
        ExecutionResult::Value(Some(value)) => value.clone(),
        ExecutionResult::Value(None) => String::new(),
    };

    if text.is_empty() {
        NO_VALUE_TEXT.to_string()
    } else {
        text
    }
}

fn timeout_text(deadline: Duration) -> String {
    format!(
        "[Execution timed out after {} seconds]",
        deadline.as_secs_f64()
    )
}


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;
    use crate::types::{Diagnostic, Severity};

    fn any_result() -> impl Strategy<Value = ExecutionResult> {
        prop_oneof![
            proptest::option::of(".*").prop_map(ExecutionResult::Value),
            proptest::collection::vec(".*", 0..4).prop_map(|messages| {
                ExecutionResult::CompileError(
                    messages
                        .into_iter()
                        .map(|message| Diagnostic {
                            severity: Severity::Error,
                            message,
                            location: None,
                        })
                        .collect(),
                )
            }),
            Just(ExecutionResult::EmitEmpty),
            ".*".prop_map(ExecutionResult::RuntimeFault),
            (0u64..100_000).prop_map(|ms| ExecutionResult::Timeout(Duration::from_millis(ms))),
            Just(ExecutionResult::Rejected),
            ".*".prop_map(ExecutionResult::SupervisionFault),
        ]
    }

    proptest! {
        #[test]
        fn never_empty(result in any_result()) {
            prop_assert!(!normalize(&result).is_empty());
        }

        #[test]
        fn non_empty_values_pass_through(value in ".+") {
            prop_assert_eq!(normalize(&ExecutionResult::Value(Some(value.clone()))), value);
        }
    }
}
