use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as TlsClientStream;
use tokio_rustls::server::TlsStream as TlsServerStream;

/// The stream types a session can run over: plain TCP, a TLS-wrapped
/// stream on either side of the handshake, or an in-memory duplex pipe
/// for test dialogs. Boxing the stream lets STARTTLS swap the transport
/// mid-session without changing the session type.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Debug + Unpin + Send {}

impl AsyncReadAndWrite for TcpStream {}
impl AsyncReadAndWrite for DuplexStream {}
impl AsyncReadAndWrite for TlsClientStream<TcpStream> {}
impl AsyncReadAndWrite for TlsClientStream<BoxedAsyncReadAndWrite> {}
impl AsyncReadAndWrite for TlsServerStream<TcpStream> {}
impl AsyncReadAndWrite for TlsServerStream<BoxedAsyncReadAndWrite> {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;

impl AsyncReadAndWrite for BoxedAsyncReadAndWrite {}
