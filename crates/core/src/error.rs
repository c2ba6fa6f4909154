use crate::types::JobCategory;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("Failed to decode {category} output: {message}")]
    Decode {
        category: JobCategory,
        message: String,
    },

    #[error("Validation failed: {0}")]
    Validation(String),
}
