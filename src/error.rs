#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Not enough bytes")]
    NotEnoughData { actual: usize, minimum: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid frame format: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
