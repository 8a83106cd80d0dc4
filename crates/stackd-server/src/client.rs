//! The service side of the collector protocol.

use crate::registration::Registration;
use serde::Serialize;
use serde::de::DeserializeOwned;
use stackd_core::ipc::ResourceDetails;
use stackd_core::{
    Call, ClientMessage, DataFrame, DeclareRequest, HttpProxyRequest, ServerMessage, TriggerKind,
    UnaryResponse,
};
use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect to collector at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("collector connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("collector rejected the call: {0}")]
    Rejected(String),
    #[error("unexpected response from collector: {0}")]
    Unexpected(String),
    #[error("collector closed the connection")]
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct CollectorClient {
    addr: SocketAddr,
}

impl CollectorClient {
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    async fn call(&self, call: &Call) -> Result<Connection, ClientError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: self.addr,
                source,
            })?;
        let (reader, writer) = stream.into_split();
        let mut connection = Connection {
            lines: BufReader::new(reader).lines(),
            writer,
        };
        connection.send(call).await?;
        Ok(connection)
    }

    async fn unary(&self, call: &Call) -> Result<UnaryResponse, ClientError> {
        let mut connection = self.call(call).await?;
        match connection.recv::<UnaryResponse>().await? {
            Some(UnaryResponse::Error(message)) => Err(ClientError::Rejected(message)),
            Some(response) => Ok(response),
            None => Err(ClientError::Closed),
        }
    }

    /// # Errors
    ///
    /// Fails on transport errors or when the collector rejects the
    /// declaration.
    pub async fn declare(&self, request: DeclareRequest) -> Result<(), ClientError> {
        match self.unary(&Call::Declare(request)).await? {
            UnaryResponse::Declared => Ok(()),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    /// # Errors
    ///
    /// Fails on transport errors.
    pub async fn details(&self) -> Result<ResourceDetails, ClientError> {
        match self.unary(&Call::Details).await? {
            UnaryResponse::Details(details) => Ok(details),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    /// # Errors
    ///
    /// Fails on transport errors. A proxy conflict is not an error here.
    pub async fn proxy(&self, request: HttpProxyRequest) -> Result<(), ClientError> {
        match self.unary(&Call::Proxy(request)).await? {
            UnaryResponse::Proxied => Ok(()),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Opens a trigger stream without registering on it.
    ///
    /// # Errors
    ///
    /// Fails if the collector cannot be reached.
    pub async fn open<R: Registration>(&self) -> Result<TriggerStream<R>, ClientError> {
        self.open_kind(R::KIND).await
    }

    /// Opens a stream for `kind` and sends frames of `R` on it, whether or not
    /// `R` is the registration that kind expects.
    ///
    /// # Errors
    ///
    /// Fails if the collector cannot be reached.
    pub async fn open_kind<R: Serialize>(&self, kind: TriggerKind) -> Result<TriggerStream<R>, ClientError> {
        let connection = self.call(&Call::open(kind)).await?;
        Ok(TriggerStream {
            connection,
            _registration: PhantomData,
        })
    }

    /// Opens the stream for `R` and completes the registration handshake.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or if the collector answers with anything
    /// but a registration response.
    pub async fn register<R: Registration>(&self, registration: R) -> Result<TriggerStream<R>, ClientError> {
        let mut stream = self.open::<R>().await?;
        stream
            .send(&ClientMessage::RegistrationRequest(registration))
            .await?;

        match stream.recv().await? {
            Some(ServerMessage::RegistrationResponse) => Ok(stream),
            Some(ServerMessage::Error(message)) => Err(ClientError::Rejected(message)),
            Some(other) => Err(ClientError::Unexpected(format!("{other:?}"))),
            None => Err(ClientError::Closed),
        }
    }
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn send<T: Serialize>(&mut self, frame: &T) -> Result<(), ClientError> {
        let mut bytes = serde_json::to_vec(frame)?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ClientError> {
        match self.lines.next_line().await? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }
}

/// An open trigger stream.
pub struct TriggerStream<R> {
    connection: Connection,
    _registration: PhantomData<fn(R)>,
}

impl<R: Serialize> TriggerStream<R> {
    /// # Errors
    ///
    /// Fails if the frame cannot be written.
    pub async fn send(&mut self, message: &ClientMessage<R>) -> Result<(), ClientError> {
        self.connection.send(message).await
    }

    /// # Errors
    ///
    /// Fails if the frame cannot be written.
    pub async fn respond(&mut self, frame: DataFrame) -> Result<(), ClientError> {
        self.connection
            .send(&ClientMessage::<R>::Response(frame))
            .await
    }

    /// The next frame from the collector, `None` once it hangs up.
    ///
    /// # Errors
    ///
    /// Fails on read errors or malformed frames.
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>, ClientError> {
        self.connection.recv().await
    }

    /// # Errors
    ///
    /// Fails if the write half cannot be shut down cleanly.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.connection.writer.shutdown().await?;
        Ok(())
    }
}
