//! The validation gate between argument resolution and handler invocation.

use crate::resolver::{ArgValue, Args, ParamSpec};

/// A type that can report its own constraint violations.
pub trait Validate {
    /// One human-readable message per violated constraint. Empty means valid.
    fn validate(&self) -> Vec<String>;
}

/// Checks resolved arguments against their declared parameters.
pub trait ParameterValidator: Send + Sync {
    fn validate_parameters(&self, params: &[ParamSpec], args: &Args) -> Vec<String>;
}

/// Default validator: enforces `required` parameters and runs the
/// [`Validate`] constraints attached with [`ParamSpec::validated`].
///
/// Violations are reported as `"<param>: <message>"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConstraintValidator;

impl ParameterValidator for ConstraintValidator {
    fn validate_parameters(&self, params: &[ParamSpec], args: &Args) -> Vec<String> {
        let mut violations = Vec::new();
        for (index, param) in params.iter().enumerate() {
            match args.raw(index) {
                None | Some(ArgValue::Absent) => {
                    if param.is_required() {
                        violations.push(format!("{}: must not be null", param.name()));
                    }
                }
                Some(ArgValue::Value(value)) => {
                    violations.extend(
                        param
                            .check(value.as_ref())
                            .into_iter()
                            .map(|msg| format!("{}: {msg}", param.name())),
                    );
                }
                Some(ArgValue::Session(_) | ArgValue::SessionId(_)) => {}
            }
        }
        violations
    }
}
