//! Errors for pipeline definition and template expansion.

use thiserror::Error;

/// Problems expanding a command template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("placeholder '{{{0}}}' has no value")]
    Unbound(String),

    #[error("unterminated placeholder in '{0}'")]
    Unterminated(String),

    #[error("empty placeholder in '{0}'")]
    EmptyPlaceholder(String),

    #[error("parameter '{0}' shadows a built-in template variable")]
    ReservedName(String),
}

/// Problems with a pipeline definition or a requested stage range.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline has no stages")]
    Empty,

    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("stage '{stage}' has ordinal {ordinal}, which does not come after {previous}")]
    OrdinalOrder {
        stage: String,
        ordinal: u32,
        previous: u32,
    },

    #[error("start stage '{start}' comes after end stage '{end}'")]
    InvalidRange { start: String, end: String },

    #[error("stage '{0}' has no command and does not run the frontend")]
    MissingCommand(String),

    #[error("unknown frontend '{name}' (available: {available})")]
    UnknownFrontend { name: String, available: String },

    #[error("stage '{stage}': {source}")]
    Template {
        stage: String,
        #[source]
        source: TemplateError,
    },
}
