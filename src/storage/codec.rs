use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rmp::decode;
use rmp::encode::{self, ValueWriteError};
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::handle::NodeHandle;
use crate::metrics::CodecStats;
use crate::model::{Label, NodeBody, NodeId, PropertyValue};

// Wire tags for the closed value set. A tagged value is the two-element
// MessagePack array `[tag, payload]`.
const TAG_NULL: i8 = 0;
const TAG_NODE_REF: i8 = 1;
const TAG_BOOL: i8 = 2;
const TAG_STRING: i8 = 3;
const TAG_BYTE: i8 = 4;
const TAG_SHORT: i8 = 5;
const TAG_INT: i8 = 6;
const TAG_LONG: i8 = 7;
const TAG_FLOAT: i8 = 8;
const TAG_DOUBLE: i8 = 9;
const TAG_LIST: i8 = 10;
const TAG_CHAR: i8 = 11;

const DECODE_LOG_INTERVAL: u64 = 1 << 17;

/// Resolves a node id referenced from a property or adjacency slot to its
/// handle, interning a new handle if the owning graph has none yet. The
/// decoded value keeps only the non-owning id; the graph retains the handle.
pub trait RefResolver: Send + Sync {
    fn resolve(&self, id: NodeId) -> Result<Arc<NodeHandle>>;
}

impl<F> RefResolver for F
where
    F: Fn(NodeId) -> Result<Arc<NodeHandle>> + Send + Sync,
{
    fn resolve(&self, id: NodeId) -> Result<Arc<NodeHandle>> {
        self(id)
    }
}

/// Structural bounds enforced while decoding untrusted bytes.
#[derive(Debug, Clone, Copy)]
pub struct CodecLimits {
    /// Maximum element count accepted for any map or array header.
    pub max_collection_len: usize,
    /// Maximum nesting depth accepted for list values.
    pub max_list_depth: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_collection_len: 1 << 20,
            max_list_depth: 16,
        }
    }
}

/// Encodes a node body into its self-describing MessagePack record:
/// `{uint id, str label, map<str, tagged> properties, array<int> edge
/// offsets, array<tagged> adjacency}`.
///
/// Deterministic for a given body; the property map iterates in key order.
pub fn encode_node(body: &NodeBody) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    encode::write_uint(&mut buf, body.id)?;
    encode::write_str(&mut buf, &body.label)?;

    encode::write_map_len(&mut buf, collection_len(body.properties.len())?)?;
    for (key, value) in &body.properties {
        encode::write_str(&mut buf, key)?;
        write_value(&mut buf, value, false)?;
    }

    encode::write_array_len(&mut buf, collection_len(body.edge_offsets.len())?)?;
    for offset in &body.edge_offsets {
        encode::write_sint(&mut buf, i64::from(*offset))?;
    }

    encode::write_array_len(&mut buf, collection_len(body.adjacency.len())?)?;
    for value in &body.adjacency {
        write_value(&mut buf, value, false)?;
    }

    Ok(buf)
}

fn write_value(buf: &mut Vec<u8>, value: &PropertyValue, inside_list: bool) -> Result<()> {
    encode::write_array_len(buf, 2)?;
    match value {
        PropertyValue::Null => {
            encode::write_sint(buf, i64::from(TAG_NULL))?;
            encode::write_nil(buf)?;
        }
        PropertyValue::NodeRef(id) => {
            encode::write_sint(buf, i64::from(TAG_NODE_REF))?;
            encode::write_uint(buf, *id)?;
        }
        PropertyValue::Bool(v) => {
            encode::write_sint(buf, i64::from(TAG_BOOL))?;
            encode::write_bool(buf, *v)?;
        }
        PropertyValue::String(s) => {
            encode::write_sint(buf, i64::from(TAG_STRING))?;
            encode::write_str(buf, s)?;
        }
        PropertyValue::Byte(v) => {
            encode::write_sint(buf, i64::from(TAG_BYTE))?;
            encode::write_sint(buf, i64::from(*v))?;
        }
        PropertyValue::Short(v) => {
            encode::write_sint(buf, i64::from(TAG_SHORT))?;
            encode::write_sint(buf, i64::from(*v))?;
        }
        PropertyValue::Int(v) => {
            encode::write_sint(buf, i64::from(TAG_INT))?;
            encode::write_sint(buf, i64::from(*v))?;
        }
        PropertyValue::Long(v) => {
            encode::write_sint(buf, i64::from(TAG_LONG))?;
            encode::write_sint(buf, *v)?;
        }
        PropertyValue::Float(v) => {
            encode::write_sint(buf, i64::from(TAG_FLOAT))?;
            encode::write_f32(buf, *v)?;
        }
        PropertyValue::Double(v) => {
            encode::write_sint(buf, i64::from(TAG_DOUBLE))?;
            encode::write_f64(buf, *v)?;
        }
        PropertyValue::Char(c) => {
            encode::write_sint(buf, i64::from(TAG_CHAR))?;
            encode::write_uint(buf, u64::from(u32::from(*c)))?;
        }
        PropertyValue::List(entries) => {
            if inside_list {
                return Err(GraphError::UnencodableValue(
                    "nested lists are not encodable; the canonical form is a flat list",
                ));
            }
            encode::write_sint(buf, i64::from(TAG_LIST))?;
            encode::write_array_len(buf, collection_len(entries.len())?)?;
            for entry in entries {
                write_value(buf, entry, true)?;
            }
        }
    }
    Ok(())
}

fn collection_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| GraphError::UnencodableValue("collection length exceeds u32::MAX"))
}

impl From<ValueWriteError> for GraphError {
    fn from(err: ValueWriteError) -> Self {
        match err {
            ValueWriteError::InvalidMarkerWrite(e) | ValueWriteError::InvalidDataWrite(e) => {
                GraphError::Io(e)
            }
        }
    }
}

/// Decodes overflow records back into node bodies, resolving `NODE_REF`
/// payloads through the owning graph.
pub struct NodeDecoder {
    resolver: Arc<dyn RefResolver>,
    limits: CodecLimits,
    decoded: AtomicU64,
    decode_time_us: AtomicU64,
}

impl NodeDecoder {
    pub fn new(resolver: Arc<dyn RefResolver>) -> Self {
        Self::with_limits(resolver, CodecLimits::default())
    }

    pub fn with_limits(resolver: Arc<dyn RefResolver>, limits: CodecLimits) -> Self {
        Self {
            resolver,
            limits,
            decoded: AtomicU64::new(0),
            decode_time_us: AtomicU64::new(0),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<NodeBody> {
        let started = Instant::now();
        let mut rd = bytes;

        let id: NodeId = decode::read_int(&mut rd).map_err(corrupt)?;
        let label = read_string(&mut rd)?;

        let prop_count = decode::read_map_len(&mut rd).map_err(corrupt)? as usize;
        self.check_collection(prop_count)?;
        let mut properties = BTreeMap::new();
        for _ in 0..prop_count {
            let key = read_string(&mut rd)?;
            let value = self.read_value(&mut rd, 0)?;
            properties.insert(key, value);
        }

        let offset_count = decode::read_array_len(&mut rd).map_err(corrupt)? as usize;
        self.check_collection(offset_count)?;
        let mut edge_offsets = Vec::with_capacity(offset_count);
        for _ in 0..offset_count {
            edge_offsets.push(decode::read_int(&mut rd).map_err(corrupt)?);
        }

        let adjacency_count = decode::read_array_len(&mut rd).map_err(corrupt)? as usize;
        self.check_collection(adjacency_count)?;
        let mut adjacency = Vec::with_capacity(adjacency_count);
        for _ in 0..adjacency_count {
            adjacency.push(self.read_value(&mut rd, 0)?);
        }

        if !rd.is_empty() {
            return Err(GraphError::CorruptFormat(
                "trailing bytes after node record".into(),
            ));
        }

        self.note_decode(started);
        Ok(NodeBody {
            id,
            label,
            properties,
            edge_offsets,
            adjacency,
        })
    }

    /// Reads only the record prefix. Used at startup to rebuild handles
    /// without materializing bodies.
    pub fn decode_ref(&self, bytes: &[u8]) -> Result<(NodeId, Label)> {
        let mut rd = bytes;
        let id: NodeId = decode::read_int(&mut rd).map_err(corrupt)?;
        let label = read_string(&mut rd)?;
        Ok((id, label))
    }

    pub fn stats(&self) -> CodecStats {
        CodecStats {
            nodes_decoded: self.decoded.load(Ordering::Relaxed),
            decode_time_us: self.decode_time_us.load(Ordering::Relaxed),
        }
    }

    fn read_value(&self, rd: &mut &[u8], depth: usize) -> Result<PropertyValue> {
        let frame = decode::read_array_len(rd).map_err(corrupt)?;
        if frame != 2 {
            return Err(GraphError::CorruptFormat(format!(
                "tagged value frame has {frame} elements, expected 2"
            )));
        }
        let tag: i8 = decode::read_int(rd).map_err(corrupt)?;
        match tag {
            TAG_NULL => {
                decode::read_nil(rd).map_err(corrupt)?;
                Ok(PropertyValue::Null)
            }
            TAG_NODE_REF => {
                let id: NodeId = decode::read_int(rd).map_err(corrupt)?;
                self.resolver.resolve(id)?;
                Ok(PropertyValue::NodeRef(id))
            }
            TAG_BOOL => Ok(PropertyValue::Bool(decode::read_bool(rd).map_err(corrupt)?)),
            TAG_STRING => Ok(PropertyValue::String(read_string(rd)?)),
            TAG_BYTE => Ok(PropertyValue::Byte(decode::read_int(rd).map_err(corrupt)?)),
            TAG_SHORT => Ok(PropertyValue::Short(decode::read_int(rd).map_err(corrupt)?)),
            TAG_INT => Ok(PropertyValue::Int(decode::read_int(rd).map_err(corrupt)?)),
            TAG_LONG => Ok(PropertyValue::Long(decode::read_int(rd).map_err(corrupt)?)),
            TAG_FLOAT => Ok(PropertyValue::Float(decode::read_f32(rd).map_err(corrupt)?)),
            TAG_DOUBLE => Ok(PropertyValue::Double(decode::read_f64(rd).map_err(corrupt)?)),
            TAG_CHAR => {
                let code: u32 = decode::read_int(rd).map_err(corrupt)?;
                char::from_u32(code)
                    .map(PropertyValue::Char)
                    .ok_or_else(|| {
                        GraphError::CorruptFormat(format!("invalid character code point {code}"))
                    })
            }
            TAG_LIST => {
                if depth >= self.limits.max_list_depth {
                    return Err(GraphError::CorruptFormat(
                        "list nesting exceeds configured depth limit".into(),
                    ));
                }
                let count = decode::read_array_len(rd).map_err(corrupt)? as usize;
                self.check_collection(count)?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(self.read_value(rd, depth + 1)?);
                }
                Ok(PropertyValue::List(entries))
            }
            other => Err(GraphError::CorruptFormat(format!("unknown value tag {other}"))),
        }
    }

    fn check_collection(&self, len: usize) -> Result<()> {
        if len > self.limits.max_collection_len {
            return Err(GraphError::CorruptFormat(format!(
                "collection of {len} elements exceeds limit of {}",
                self.limits.max_collection_len
            )));
        }
        Ok(())
    }

    fn note_decode(&self, started: Instant) {
        let count = self.decoded.fetch_add(1, Ordering::Relaxed) + 1;
        self.decode_time_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        if count % DECODE_LOG_INTERVAL == 0 {
            let total_us = self.decode_time_us.load(Ordering::Relaxed);
            debug!(
                decoded = count,
                avg_us = total_us as f64 / count as f64,
                "node decode statistics"
            );
        }
    }
}

fn read_string(rd: &mut &[u8]) -> Result<String> {
    let len = decode::read_str_len(rd).map_err(corrupt)? as usize;
    let bytes = take(rd, len)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| GraphError::CorruptFormat("invalid UTF-8 string".into()))
}

fn take<'a>(rd: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if rd.len() < len {
        return Err(GraphError::CorruptFormat("unexpected end of record".into()));
    }
    let (head, tail) = rd.split_at(len);
    *rd = tail;
    Ok(head)
}

fn corrupt(err: impl std::fmt::Display) -> GraphError {
    GraphError::CorruptFormat(err.to_string())
}
