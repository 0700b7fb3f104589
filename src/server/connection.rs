use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ServerState;
use crate::proto::decode_frame;
use crate::proto::encode_frame;
use crate::proto::frame_codec;
use crate::proto::ClientFrame;
use crate::proto::ConnectResponse;
use crate::proto::ServerFrame;
use crate::Error;
use crate::Result;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) async fn serve_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    shutdown: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, frame_codec());
    let conn_id = state.next_conn_id();

    let request = match timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(bytes))) => match decode_frame::<ClientFrame>(&bytes)? {
            ClientFrame::Connect(request) => request,
            ClientFrame::Request { .. } => {
                return Err(Error::Protocol("request before handshake".to_string()));
            }
        },
        Ok(Some(Err(e))) => return Err(e.into()),
        // Peer went away before saying hello
        Ok(None) => return Ok(()),
        Err(_) => return Err(Error::Protocol("handshake timed out".to_string())),
    };

    let response = state.handshake(conn_id, &request);
    framed.send(encode_frame(&ServerFrame::Connected(response.clone()))?).await?;
    let session_id = match response {
        ConnectResponse::Established { session_id, .. } => session_id,
        ConnectResponse::Expired => return Ok(()),
    };

    let (sender, receiver) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();
    state.attach(conn_id, sender.clone(), kill.clone());

    let result = run_session(&state, framed, conn_id, session_id, sender, receiver, &shutdown, &kill).await;
    state.connection_closed(conn_id, session_id);
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    state: &ServerState,
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    conn_id: u64,
    session_id: u64,
    sender: mpsc::UnboundedSender<ServerFrame>,
    mut receiver: mpsc::UnboundedReceiver<ServerFrame>,
    shutdown: &CancellationToken,
    kill: &CancellationToken,
) -> Result<()> {
    let (mut sink, mut stream) = framed.split();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = kill.cancelled() => {
                debug!(conn_id, session_id, "Connection superseded");
                return Ok(());
            }
            outbound = receiver.recv() => match outbound {
                Some(frame) => sink.send(encode_frame(&frame)?).await?,
                None => return Ok(()),
            },
            inbound = stream.next() => match inbound {
                Some(Ok(bytes)) => match decode_frame::<ClientFrame>(&bytes)? {
                    ClientFrame::Request { xid, request } => {
                        let response = state.handle_request(conn_id, session_id, request);
                        let _ = sender.send(ServerFrame::Reply { xid, response });
                    }
                    ClientFrame::Connect(_) => {
                        return Err(Error::Protocol("duplicate handshake".to_string()));
                    }
                },
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
        }
    }
}
