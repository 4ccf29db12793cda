mod client;
mod command;
mod response;
mod timeouts;
mod tls;
mod traits;
mod transaction;

pub use client::*;
pub use command::*;
pub use response::*;
pub use timeouts::*;
pub use tls::*;
pub use traits::*;
pub use transaction::*;
