use crate::registration::{Registration, RegistrationStream, StreamState};
use crate::requirements::{DeclareError, ServiceRequirements};
use serde::Serialize;
use stackd_core::ipc::ResourceDetails;
use stackd_core::{
    Call, ClientMessage, ListenerRegistration, RouteRegistration, ScheduleRegistration,
    ServerMessage, SubscriptionRegistration, TriggerKind, UnaryResponse, WebsocketRegistration,
};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Longest frame the collector reads, not counting the newline.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Why a collector call was ended. The message is also sent to the service
/// as an error frame when the connection still allows it.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("first message on the {0} stream must be a registration request")]
    RegistrationExpected(TriggerKind),
    #[error("the {0} stream is already registered")]
    AlreadyRegistered(TriggerKind),
    #[error("connection closed before a {0} registration was received")]
    ClosedBeforeRegistration(TriggerKind),
    #[error("requirements for service {0} are closed")]
    Closed(String),
    #[error(transparent)]
    Declare(#[from] DeclareError),
    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),
    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to read frame: {0}")]
    Receive(#[source] io::Error),
    #[error("failed to write frame: {0}")]
    Send(#[source] io::Error),
}

type FrameReader = BufReader<OwnedReadHalf>;

/// Serves collector calls for one service until the task is aborted.
///
/// Connections run in a [`JoinSet`] owned by this task, so aborting the
/// server also aborts every call still in flight.
pub async fn run_collector_server(listener: TcpListener, requirements: Arc<ServiceRequirements>) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Collector for {} accepted {}", requirements.service_name(), addr);
                    let requirements = Arc::clone(&requirements);
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, Arc::clone(&requirements)).await {
                            warn!(
                                "Call from {} for service {} failed: {}",
                                addr,
                                requirements.service_name(),
                                e
                            );
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    error!("Collector call for {} panicked: {}", requirements.service_name(), e);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    requirements: Arc<ServiceRequirements>,
) -> Result<(), ProtocolError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let frame = match next_frame(&mut reader).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return Ok(()),
        Err(e) => return reject(&mut writer, e).await,
    };

    let call: Call = match serde_json::from_slice(&frame) {
        Ok(call) => call,
        Err(e) => return reject(&mut writer, ProtocolError::Decode(e)).await,
    };

    match call {
        Call::Declare(request) => {
            let result = requirements.declare(request);
            let response = match &result {
                Ok(()) => UnaryResponse::Declared,
                Err(e) => UnaryResponse::Error(e.to_string()),
            };
            write_frame(&mut writer, &response).await?;
            result.map_err(ProtocolError::from)
        }
        Call::Details => {
            write_frame(&mut writer, &UnaryResponse::Details(ResourceDetails::default())).await
        }
        Call::Proxy(_) if requirements.is_closed() => {
            let closed = ProtocolError::Closed(requirements.service_name().to_string());
            reject(&mut writer, closed).await
        }
        Call::Proxy(request) => {
            requirements.proxy(request);
            write_frame(&mut writer, &UnaryResponse::Proxied).await
        }
        Call::Serve => serve_stream::<RouteRegistration>(reader, writer, requirements).await,
        Call::Schedule => serve_stream::<ScheduleRegistration>(reader, writer, requirements).await,
        Call::Subscribe => {
            serve_stream::<SubscriptionRegistration>(reader, writer, requirements).await
        }
        Call::Listen => serve_stream::<ListenerRegistration>(reader, writer, requirements).await,
        Call::HandleEvents => {
            serve_stream::<WebsocketRegistration>(reader, writer, requirements).await
        }
    }
}

async fn reject(writer: &mut OwnedWriteHalf, err: ProtocolError) -> Result<(), ProtocolError> {
    write_frame(writer, &UnaryResponse::Error(err.to_string())).await?;
    Err(err)
}

async fn serve_stream<R: Registration>(
    mut reader: FrameReader,
    mut writer: OwnedWriteHalf,
    requirements: Arc<ServiceRequirements>,
) -> Result<(), ProtocolError> {
    let mut stream = RegistrationStream::<R>::new(requirements);

    loop {
        let outcome = match next_frame(&mut reader).await {
            Ok(Some(frame)) => serde_json::from_slice::<ClientMessage<R>>(&frame)
                .map_err(ProtocolError::Decode)
                .and_then(|message| stream.handle(message)),
            Ok(None) => {
                return match stream.state() {
                    StreamState::AwaitingRegistration => {
                        Err(ProtocolError::ClosedBeforeRegistration(R::KIND))
                    }
                    StreamState::Registered => Ok(()),
                };
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Some(reply)) => write_frame(&mut writer, &reply).await?,
            Ok(None) => {}
            Err(e) => {
                // Best effort: the service may already be gone.
                if let Err(send) = write_frame(&mut writer, &ServerMessage::Error(e.to_string())).await {
                    debug!("Could not report stream error: {}", send);
                }
                return Err(e);
            }
        }
    }
}

/// Reads the next non-blank line, without its line ending. Returns `None` at
/// end of input.
async fn next_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(MAX_FRAME_LEN + 1).unwrap_or(u64::MAX);
    let mut frame = Vec::new();

    loop {
        frame.clear();
        let read = (&mut *reader)
            .take(limit)
            .read_until(b'\n', &mut frame)
            .await
            .map_err(ProtocolError::Receive)?;
        if read == 0 {
            return Ok(None);
        }

        if frame.last() == Some(&b'\n') {
            frame.pop();
            if frame.last() == Some(&b'\r') {
                frame.pop();
            }
        } else if frame.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(MAX_FRAME_LEN));
        }

        if !frame.iter().all(u8::is_ascii_whitespace) {
            return Ok(Some(frame));
        }
    }
}

async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(frame).map_err(ProtocolError::Encode)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await.map_err(ProtocolError::Send)?;
    writer.flush().await.map_err(ProtocolError::Send)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    async fn frames(input: &[u8]) -> Vec<Vec<u8>> {
        let mut reader = input;
        let mut frames = Vec::new();
        while let Some(frame) = next_frame(&mut reader).await.unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn blank_lines_and_line_endings_are_dropped() {
        let frames = frames(b"\n{\"call\":\"details\"}\r\n  \n{}\n[]").await;
        assert_eq!(frames, vec![b"{\"call\":\"details\"}".to_vec(), b"{}".to_vec(), b"[]".to_vec()]);
    }

    #[tokio::test]
    async fn frame_at_the_limit_is_read() {
        let mut input = vec![b'a'; MAX_FRAME_LEN];
        input.push(b'\n');

        let frames = frames(&input).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), MAX_FRAME_LEN);
    }

    #[tokio::test]
    async fn longer_frame_is_refused() {
        let mut input = vec![b'a'; MAX_FRAME_LEN + 1];
        input.push(b'\n');

        let mut reader = input.as_slice();
        let err = next_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(MAX_FRAME_LEN)));
    }
}
