use thiserror::Error;

#[derive(Error, Debug)]
pub enum GangwayError {
    #[error("config error: {0}")]
    Config(String),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to bind listener: {0}")]
    Bind(String),
}

pub type Result<T> = std::result::Result<T, GangwayError>;
