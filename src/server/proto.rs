//! Request/reply message encoding.
//!
//! Bodies are self-describing binary: big-endian u32 length-prefixed byte
//! strings, big-endian u32 counted lists, big-endian u64 ids. Documents and
//! diff ops ride as JSON inside a length-prefixed byte string for forward
//! compatibility.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::model::{
    ChangeNotification, ConflictRecord, Diff, DiffId, DiffOp, DiffOpId, Document, EntityName,
    SourceName,
};

use super::ProtocolError;

pub const TAG_LIST_CONFLICTS: u32 = 0;
pub const TAG_CHANGE: u32 = 1;
pub const TAG_RESOLVE: u32 = 2;

pub const STATUS_OK: u8 = 0;
pub const STATUS_ERR: u8 = 1;

pub const ERR_TIMEOUT: u8 = 0;
pub const ERR_FRAMING: u8 = 1;
pub const ERR_DECODE: u8 = 2;
pub const ERR_UNKNOWN: u8 = 255;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    ListConflicts,
    Change(ChangeNotification),
    Resolve {
        diff_id: DiffId,
        ops: Vec<DiffOpId>,
    },
}

/// One parked conflict as reported to clients.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictEntry {
    pub initial: Document,
    pub diff: Diff<()>,
    pub diff_id: DiffId,
    pub conflicts: Vec<(DiffOpId, DiffOp<()>)>,
}

impl From<ConflictRecord> for ConflictEntry {
    fn from(record: ConflictRecord) -> Self {
        Self {
            initial: record.initial,
            diff: record.diff,
            diff_id: record.diff_id,
            conflicts: record.conflicts,
        }
    }
}

pub fn encode_request(request: &Request) -> Result<(u32, Vec<u8>), ProtocolError> {
    match request {
        Request::ListConflicts => Ok((TAG_LIST_CONFLICTS, Vec::new())),
        Request::Change(notification) => {
            let mut body = BodyWriter::new();
            body.put_str(notification.entity.as_str());
            body.put_str(notification.source.as_str());
            body.put_str(&notification.foreign_id);
            Ok((TAG_CHANGE, body.finish()))
        }
        Request::Resolve { diff_id, ops } => {
            let mut body = BodyWriter::new();
            body.put_u64(diff_id.0 as u64);
            body.put_u32(ops.len() as u32);
            for op in ops {
                body.put_u64(op.0 as u64);
            }
            Ok((TAG_RESOLVE, body.finish()))
        }
    }
}

pub fn decode_request(tag: u32, body: &[u8]) -> Result<Request, ProtocolError> {
    let mut reader = BodyReader::new(body);
    let request = match tag {
        TAG_LIST_CONFLICTS => Request::ListConflicts,
        TAG_CHANGE => {
            let entity = EntityName::new(reader.take_str()?)
                .map_err(|e| ProtocolError::Decode(e.to_string()))?;
            let source = SourceName::new(reader.take_str()?)
                .map_err(|e| ProtocolError::Decode(e.to_string()))?;
            let foreign_id = reader.take_str()?;
            Request::Change(ChangeNotification {
                entity,
                source,
                foreign_id,
            })
        }
        TAG_RESOLVE => {
            let diff_id = DiffId(reader.take_u64()? as i64);
            let count = reader.take_u32()?;
            let mut ops = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                ops.push(DiffOpId(reader.take_u64()? as i64));
            }
            Request::Resolve { diff_id, ops }
        }
        other => return Err(ProtocolError::UnknownTag(other)),
    };
    reader.finish()?;
    Ok(request)
}

pub fn encode_conflicts(entries: &[ConflictEntry]) -> Result<Vec<u8>, ProtocolError> {
    let mut body = BodyWriter::new();
    body.put_u32(entries.len() as u32);
    for entry in entries {
        body.put_json(&entry.initial)?;
        body.put_json(&entry.diff)?;
        body.put_u64(entry.diff_id.0 as u64);
        body.put_u32(entry.conflicts.len() as u32);
        for (op_id, op) in &entry.conflicts {
            body.put_u64(op_id.0 as u64);
            body.put_json(op)?;
        }
    }
    Ok(body.finish())
}

pub fn decode_conflicts(body: &[u8]) -> Result<Vec<ConflictEntry>, ProtocolError> {
    let mut reader = BodyReader::new(body);
    let count = reader.take_u32()?;
    let mut entries = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let initial: Document = reader.take_json()?;
        let diff: Diff<()> = reader.take_json()?;
        let diff_id = DiffId(reader.take_u64()? as i64);
        let op_count = reader.take_u32()?;
        let mut conflicts = Vec::with_capacity(op_count.min(1024) as usize);
        for _ in 0..op_count {
            let op_id = DiffOpId(reader.take_u64()? as i64);
            let op: DiffOp<()> = reader.take_json()?;
            conflicts.push((op_id, op));
        }
        entries.push(ConflictEntry {
            initial,
            diff,
            diff_id,
            conflicts,
        });
    }
    reader.finish()?;
    Ok(entries)
}

struct BodyWriter {
    buf: Vec<u8>,
}

impl BodyWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    fn put_json<T: Serialize>(&mut self, value: &T) -> Result<(), ProtocolError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| ProtocolError::Decode(format!("json encode: {e}")))?;
        self.put_bytes(&bytes);
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| ProtocolError::Decode("body truncated".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u32(&mut self) -> Result<u32, ProtocolError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_u64(&mut self) -> Result<u64, ProtocolError> {
        let bytes = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(out))
    }

    fn take_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.take_u32()? as usize;
        self.take(len)
    }

    fn take_str(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.take_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ProtocolError::Decode(format!("invalid utf-8: {e}")))
    }

    fn take_json<T: DeserializeOwned>(&mut self) -> Result<T, ProtocolError> {
        let bytes = self.take_bytes()?;
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(format!("json: {e}")))
    }

    /// Trailing bytes are a wrong-arity body.
    fn finish(self) -> Result<(), ProtocolError> {
        if self.pos != self.buf.len() {
            return Err(ProtocolError::Decode(format!(
                "{} trailing bytes",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}
