use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download error: {0}")]
    Download(#[from] segdl_engine::DownloadError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Download failed: {0}")]
    Failed(String),

    #[error("Download cancelled")]
    Cancelled,
}

impl AppError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Cancelled => 130,
            AppError::InvalidInput(_) => 2,
            _ => 1,
        }
    }
}
