//! Request/reply server.
//!
//! A single-threaded request loop bound to one configured address. Each
//! request is a two-frame message (tag, body); each response is a status
//! byte plus a body. CHANGE is strictly validate, enqueue, ack; conflict
//! listing and resolution are synchronous against the store. Every error is
//! caught at the request boundary and converted to a wire error code.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::metrics::Metrics;
use crate::model::WorkItem;
use crate::source::SourceRegistry;
use crate::store::{Store, StoreError, StoreHandle};

pub mod frame;
pub mod proto;

pub use frame::{FrameReader, FrameWriter};
pub use proto::{ConflictEntry, Request};

const ACCEPT_POLL: Duration = Duration::from_millis(25);
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("bad framing: {0}")]
    Framing(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("unknown request tag {0}")]
    UnknownTag(u32),
}

impl ProtocolError {
    pub fn wire_code(&self) -> u8 {
        match self {
            ProtocolError::Io(err) if is_timeout(err) => proto::ERR_TIMEOUT,
            ProtocolError::Io(_) | ProtocolError::UnknownTag(_) => proto::ERR_UNKNOWN,
            ProtocolError::Framing(_) => proto::ERR_FRAMING,
            ProtocolError::Decode(_) => proto::ERR_DECODE,
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Server {
    listen_addr: String,
    store: Arc<dyn Store>,
    registry: Arc<SourceRegistry>,
    metrics: Metrics,
    shutdown: Arc<AtomicBool>,
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    join: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the request loop to exit after its current reply.
    pub fn join(self) {
        let _ = self.join.join();
    }
}

impl Server {
    pub fn new(
        listen_addr: String,
        store: Arc<dyn Store>,
        registry: Arc<SourceRegistry>,
        metrics: Metrics,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            listen_addr,
            store,
            registry,
            metrics,
            shutdown,
        }
    }

    pub fn start(self) -> Result<ServerHandle, ServerError> {
        let listener = TcpListener::bind(&self.listen_addr)?;
        let local_addr = listener.local_addr()?;
        let store = self.store.handle()?;

        tracing::info!(%local_addr, "server listening");
        let join = thread::spawn(move || run_request_loop(listener, store, self));

        Ok(ServerHandle { local_addr, join })
    }
}

fn run_request_loop(listener: TcpListener, mut store: Box<dyn StoreHandle>, server: Server) {
    if let Err(err) = listener.set_nonblocking(true) {
        tracing::error!("server failed to set nonblocking: {err}");
        return;
    }

    loop {
        if server.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "client connected");
                match serve_connection(stream, &mut store, &server) {
                    Ok(()) => tracing::debug!(%peer, "client disconnected"),
                    Err(err) => tracing::debug!(%peer, "connection closed: {err}"),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                tracing::warn!("accept error: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    tracing::info!("request loop stopped");
}

/// One request at a time until the peer closes or errors out.
fn serve_connection(
    stream: TcpStream,
    store: &mut Box<dyn StoreHandle>,
    server: &Server,
) -> Result<(), ProtocolError> {
    stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
    stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;
    let mut reader = FrameReader::new(stream.try_clone()?);
    let mut writer = FrameWriter::new(stream);

    loop {
        if server.shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }

        let tag_frame = match reader.read_next() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            // An idle client that stops mid-silence is just gone.
            Err(ProtocolError::Io(err)) if is_timeout(&err) => return Ok(()),
            Err(err) => {
                let _ = write_reply(&mut writer, proto::STATUS_ERR, &[err.wire_code()]);
                return Err(err);
            }
        };

        let (status, body) = match parse_tag(&tag_frame) {
            Err(err) => (proto::STATUS_ERR, vec![err.wire_code()]),
            Ok(tag) => match reader.read_next() {
                Ok(Some(request_body)) => handle_request(tag, &request_body, store, server),
                Ok(None) => {
                    let err = ProtocolError::Framing("missing body frame".to_string());
                    let _ = write_reply(&mut writer, proto::STATUS_ERR, &[err.wire_code()]);
                    return Err(err);
                }
                Err(err) => {
                    let _ = write_reply(&mut writer, proto::STATUS_ERR, &[err.wire_code()]);
                    return Err(err);
                }
            },
        };
        write_reply(&mut writer, status, &body)?;
    }
}

fn write_reply(
    writer: &mut FrameWriter<TcpStream>,
    status: u8,
    body: &[u8],
) -> Result<(), ProtocolError> {
    writer.write_frame(&[status])?;
    writer.write_frame(body)
}

fn parse_tag(frame: &[u8]) -> Result<u32, ProtocolError> {
    let bytes: [u8; 4] = frame
        .try_into()
        .map_err(|_| ProtocolError::Framing(format!("tag frame of {} bytes", frame.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

fn handle_request(
    tag: u32,
    body: &[u8],
    store: &mut Box<dyn StoreHandle>,
    server: &Server,
) -> (u8, Vec<u8>) {
    server.metrics.counter("server.requests").incr();
    let request = match proto::decode_request(tag, body) {
        Ok(request) => request,
        Err(err) => {
            tracing::debug!("bad request: {err}");
            return (proto::STATUS_ERR, vec![err.wire_code()]);
        }
    };
    match dispatch(request, store, server) {
        Ok(body) => (proto::STATUS_OK, body),
        Err(code) => (proto::STATUS_ERR, vec![code]),
    }
}

fn dispatch(
    request: Request,
    store: &mut Box<dyn StoreHandle>,
    server: &Server,
) -> Result<Vec<u8>, u8> {
    match request {
        Request::ListConflicts => {
            let records = store.list_conflicts().map_err(internal_error)?;
            let entries: Vec<ConflictEntry> = records.into_iter().map(Into::into).collect();
            proto::encode_conflicts(&entries).map_err(|err| {
                tracing::warn!("conflict encode failed: {err}");
                proto::ERR_UNKNOWN
            })
        }
        Request::Change(notification) => {
            if !server
                .registry
                .is_registered(&notification.entity, &notification.source)
            {
                tracing::warn!("change for unregistered pair {notification}");
                return Err(proto::ERR_UNKNOWN);
            }
            store
                .enqueue(&WorkItem::Process(notification))
                .map_err(internal_error)?;
            server.metrics.counter("server.notifications").incr();
            Ok(Vec::new())
        }
        Request::Resolve { diff_id, ops } => {
            let diff = store.resolve_ops(diff_id, &ops).map_err(|err| match err {
                StoreError::ConflictResolved(_) | StoreError::ForeignOp { .. } => {
                    tracing::debug!("resolve rejected: {err}");
                    proto::ERR_UNKNOWN
                }
                err => internal_error(err),
            })?;
            store
                .enqueue(&WorkItem::Apply {
                    diff_id,
                    diff,
                    accepted: ops,
                })
                .map_err(internal_error)?;
            server.metrics.counter("server.resolutions").incr();
            Ok(Vec::new())
        }
    }
}

fn internal_error(err: StoreError) -> u8 {
    tracing::warn!("request failed against the store: {err}");
    proto::ERR_UNKNOWN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_frames_must_be_four_bytes() {
        assert!(parse_tag(&[0, 0, 0, 1]).is_ok());
        assert!(matches!(
            parse_tag(&[0, 1]),
            Err(ProtocolError::Framing(_))
        ));
        assert!(matches!(
            parse_tag(&[0, 0, 0, 0, 1]),
            Err(ProtocolError::Framing(_))
        ));
    }

    #[test]
    fn wire_codes_match_the_protocol_table() {
        let timeout = ProtocolError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert_eq!(timeout.wire_code(), proto::ERR_TIMEOUT);
        assert_eq!(
            ProtocolError::Framing("bad".to_string()).wire_code(),
            proto::ERR_FRAMING
        );
        assert_eq!(
            ProtocolError::Decode("bad".to_string()).wire_code(),
            proto::ERR_DECODE
        );
        assert_eq!(ProtocolError::UnknownTag(9).wire_code(), proto::ERR_UNKNOWN);
    }
}
