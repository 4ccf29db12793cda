mod error;
mod headers;
mod lineread;
mod parser;

pub use error::MailParsingError;
pub type Result<T> = std::result::Result<T, MailParsingError>;

pub use headers::*;
pub use lineread::*;
pub use parser::*;
