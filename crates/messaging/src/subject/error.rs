use thiserror::Error;

/// Errors raised while validating subjects.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Subject has no tokens at all.
    #[error("empty subject")]
    Empty,

    /// Subject contains two consecutive dots or a leading/trailing dot.
    #[error("subject `{0}` contains an empty token")]
    EmptyToken(String),

    /// Subject contains whitespace or a reserved character.
    #[error("subject `{0}` contains invalid characters")]
    InvalidCharacters(String),

    /// The multi-level wildcard was followed by more tokens.
    #[error("subject `{0}` has a non-terminal `>` wildcard")]
    NonTerminalWildcard(String),

    /// Key already present in a subject map.
    #[error("subject `{0}` is already mapped")]
    Duplicate(String),
}
