//! Blocking client for the request/reply protocol.

use std::net::TcpStream;
use std::time::Duration;

use thiserror::Error;

use crate::config::{parse_address, ConfigError};
use crate::model::{ChangeNotification, DiffId, DiffOpId, EntityName, NameError, SourceName};
use crate::server::proto::{self, ConflictEntry, Request};
use crate::server::{FrameReader, FrameWriter, ProtocolError};

const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Address(#[from] ConfigError),
    #[error(transparent)]
    Name(#[from] NameError),
    #[error("server replied with error code {0}")]
    Server(u8),
}

impl ClientError {
    /// Human description of a wire error code.
    pub fn describe(code: u8) -> &'static str {
        match code {
            proto::ERR_TIMEOUT => "timeout",
            proto::ERR_FRAMING => "bad framing",
            proto::ERR_DECODE => "decode failure",
            _ => "unknown error",
        }
    }
}

pub struct Client {
    reader: FrameReader<TcpStream>,
    writer: FrameWriter<TcpStream>,
}

impl Client {
    /// Connect to a `tcp://HOST:PORT` address.
    pub fn connect(address: &str) -> Result<Self, ClientError> {
        let addr = parse_address(address)?;
        let stream = TcpStream::connect(&addr).map_err(ProtocolError::Io)?;
        stream
            .set_read_timeout(Some(SOCKET_TIMEOUT))
            .map_err(ProtocolError::Io)?;
        stream
            .set_write_timeout(Some(SOCKET_TIMEOUT))
            .map_err(ProtocolError::Io)?;
        let reader = FrameReader::new(stream.try_clone().map_err(ProtocolError::Io)?);
        Ok(Self {
            reader,
            writer: FrameWriter::new(stream),
        })
    }

    pub fn notify(
        &mut self,
        entity: &str,
        source: &str,
        foreign_id: &str,
    ) -> Result<(), ClientError> {
        let request = Request::Change(ChangeNotification {
            entity: EntityName::new(entity)?,
            source: SourceName::new(source)?,
            foreign_id: foreign_id.to_string(),
        });
        self.roundtrip(&request)?;
        Ok(())
    }

    pub fn list_conflicts(&mut self) -> Result<Vec<ConflictEntry>, ClientError> {
        let body = self.roundtrip(&Request::ListConflicts)?;
        Ok(proto::decode_conflicts(&body)?)
    }

    pub fn resolve(&mut self, diff_id: DiffId, ops: &[DiffOpId]) -> Result<(), ClientError> {
        let request = Request::Resolve {
            diff_id,
            ops: ops.to_vec(),
        };
        self.roundtrip(&request)?;
        Ok(())
    }

    fn roundtrip(&mut self, request: &Request) -> Result<Vec<u8>, ClientError> {
        let (tag, body) = proto::encode_request(request)?;
        self.writer.write_frame(&tag.to_be_bytes())?;
        self.writer.write_frame(&body)?;

        let status = self
            .reader
            .read_next()?
            .ok_or_else(|| ProtocolError::Framing("connection closed".to_string()))?;
        let reply = self
            .reader
            .read_next()?
            .ok_or_else(|| ProtocolError::Framing("missing response body".to_string()))?;

        match status.as_slice() {
            [proto::STATUS_OK] => Ok(reply),
            [proto::STATUS_ERR] => Err(ClientError::Server(
                reply.first().copied().unwrap_or(proto::ERR_UNKNOWN),
            )),
            other => Err(ProtocolError::Framing(format!(
                "status frame of {} bytes",
                other.len()
            ))
            .into()),
        }
    }
}
