use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum GlDiscError {
    #[error("invalid discriminator config: {0}")]
    InvalidConfig(String),

    #[error(
        "embedding widths do not add up: global {global} + local {local} != fusion input {expected}"
    )]
    EmbeddingWidth {
        global: usize,
        local: usize,
        expected: usize,
    },

    #[error("io error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("tensor '{name}' has unsupported dtype {dtype}")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("cannot read tensor data for '{name}': {message}")]
    TensorData { name: String, message: String },

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, GlDiscError>;
