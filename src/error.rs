use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Type mismatch for '{name}': expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    #[error("Blob error: {0}")]
    Blob(String),

    #[error("Backend error: {0}")]
    Backend(String),
}
