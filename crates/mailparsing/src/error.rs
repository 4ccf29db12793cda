use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailParsingError {
    #[error("invalid header: {0}")]
    HeaderParse(String),
    #[error("multipart declared without a boundary parameter")]
    MissingBoundary,
    #[error("IO error while parsing message: {0}")]
    Io(#[from] std::io::Error),
}
