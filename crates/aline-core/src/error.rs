use std::fmt;

/// Client-input failures, rejected before any model computation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    RowCount { expected: usize, got: usize },
    ChannelWidth { hour: usize, expected: usize, got: usize },
    NonFinite { hour: usize, channel: usize },
    HourOutOfRange { hour: i64 },
    InvalidK { k: i64 },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::RowCount { expected, got } => {
                write!(f, "expected {expected} hours of features, got {got}")
            }
            ValidationError::ChannelWidth { hour, expected, got } => {
                write!(f, "hour {hour}: expected {expected} features, got {got}")
            }
            ValidationError::NonFinite { hour, channel } => {
                write!(f, "hour {hour}: channel {channel} is not a finite number")
            }
            ValidationError::HourOutOfRange { hour } => {
                write!(f, "observed hour {hour} is outside 0..24")
            }
            ValidationError::InvalidK { k } => write!(f, "k must be positive, got {k}"),
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
pub enum AlineError {
    Validation(ValidationError),
    Tensor(candle_core::Error),
    /// Parameter bundle is missing a tensor or a tensor has the wrong shape.
    Params(String),
    Config(String),
}

impl AlineError {
    pub fn is_validation(&self) -> bool {
        matches!(self, AlineError::Validation(_))
    }
}

impl fmt::Display for AlineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlineError::Validation(e) => write!(f, "validation error: {e}"),
            AlineError::Tensor(e) => write!(f, "tensor error: {e}"),
            AlineError::Params(msg) => write!(f, "invalid parameters: {msg}"),
            AlineError::Config(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for AlineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AlineError::Validation(e) => Some(e),
            AlineError::Tensor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ValidationError> for AlineError {
    fn from(e: ValidationError) -> Self {
        AlineError::Validation(e)
    }
}

impl From<candle_core::Error> for AlineError {
    fn from(e: candle_core::Error) -> Self {
        AlineError::Tensor(e)
    }
}

pub type Result<T> = std::result::Result<T, AlineError>;
