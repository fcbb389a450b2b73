use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use ndarray::ShapeError;

use crate::initialization::InitErr;

/// The result type used in the entire split learning crate.
pub type Result<T> = std::result::Result<T, SplitErr>;

/// The split learning crate's error type.
#[derive(Debug)]
pub enum SplitErr {
    /// An array reached a stage with a shape different from the declared one.
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    LabelOutOfRange {
        label: usize,
        classes: usize,
    },
    /// The estimate-grad mode was requested without labels.
    MissingLabels,
    /// A backward pass was requested but the stage holds no recorded forward pass.
    NoGraph {
        stage: &'static str,
    },
    /// The loss handed to backward belongs to a different recording.
    StaleLoss {
        got: u64,
        expected: u64,
    },
    InvalidArch(String),
    NonFiniteLoss {
        loss: f32,
    },
    Estimator(String),
    Init(InitErr),
    Array(ShapeError),
    Config(serde_json::Error),
    Io(io::Error),
}

impl Display for SplitErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch for {what}: got {got:?}, expected {expected:?}"
            ),
            SplitErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "there's a size mismatch for {what}, got {got} and expected {expected}"
            ),
            SplitErr::LabelOutOfRange { label, classes } => write!(
                f,
                "label {label} is out of range for a head with {classes} classes"
            ),
            SplitErr::MissingLabels => {
                write!(f, "estimating gradients requires labels to form the auxiliary loss")
            }
            SplitErr::NoGraph { stage } => write!(
                f,
                "the {stage} stage has no recorded forward pass to backpropagate through"
            ),
            SplitErr::StaleLoss { got, expected } => write!(
                f,
                "the loss belongs to recording {got} but the stage holds recording {expected}"
            ),
            SplitErr::InvalidArch(msg) => write!(f, "invalid architecture: {msg}"),
            SplitErr::NonFiniteLoss { loss } => {
                write!(f, "the objective evaluated to a non finite loss: {loss}")
            }
            SplitErr::Estimator(msg) => write!(f, "gradient estimation failed: {msg}"),
            SplitErr::Init(e) => write!(f, "parameter initialization failed: {e}"),
            SplitErr::Array(e) => write!(f, "array error: {e}"),
            SplitErr::Config(e) => write!(f, "invalid configuration: {e}"),
            SplitErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for SplitErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SplitErr::Init(e) => Some(e),
            SplitErr::Array(e) => Some(e),
            SplitErr::Config(e) => Some(e),
            SplitErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for SplitErr {
    fn from(value: ShapeError) -> Self {
        Self::Array(value)
    }
}

impl From<InitErr> for SplitErr {
    fn from(value: InitErr) -> Self {
        Self::Init(value)
    }
}

impl From<serde_json::Error> for SplitErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(value)
    }
}

impl From<io::Error> for SplitErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Checks that an array has exactly the expected shape.
///
/// # Arguments
/// * `what` - The name of the checked array, used in the error.
/// * `got` - The actual shape.
/// * `expected` - The declared shape.
pub(crate) fn ensure_shape(what: &'static str, got: &[usize], expected: &[usize]) -> Result<()> {
    if got != expected {
        return Err(SplitErr::ShapeMismatch {
            what,
            got: got.to_vec(),
            expected: expected.to_vec(),
        });
    }

    Ok(())
}
