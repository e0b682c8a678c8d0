//! Binary encoding of node bodies.
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! id u64 | label str | prop_count u32 | (key str, value)*
//!        | index_width u8 | index_len u32 | index entries (1, 2 or 4 bytes each)
//!        | payload_len u32 | payload entry*
//! ```
//!
//! A payload entry is `TAG_NULL`, `TAG_NODE_REF id u64`, or a tagged value.
//! Holes are written as `TAG_NULL` since slot positions are significant.

use std::convert::TryInto;
use std::sync::Arc;
use std::time::Instant;

use crate::adjacency::{strides_of, IndexWidth, Slot};
use crate::node::{NodeAdjacency, NodeBody, NodeRef};
use crate::schema::Schema;
use crate::types::{GraphError, NodeId, PropValue, Result};

use super::stats::SerializationStats;

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_LIST: u8 = 0x06;
const TAG_NODE_REF: u8 = 0x10;

const WIDTH_BYTE: u8 = 1;
const WIDTH_SHORT: u8 = 2;
const WIDTH_INT: u8 = 4;

/// Converts node bodies to and from their stored form.
pub struct NodeCodec {
    schema: Arc<Schema>,
    stats: Option<SerializationStats>,
}

impl NodeCodec {
    /// Codec for bodies of `schema`. `stats` enables timing counters.
    pub fn new(schema: Arc<Schema>, stats: bool) -> Self {
        Self {
            schema,
            stats: stats.then(SerializationStats::default),
        }
    }

    /// Timing counters, when enabled.
    pub fn stats(&self) -> Option<&SerializationStats> {
        self.stats.as_ref()
    }

    /// Encodes a body.
    pub fn serialize(&self, body: &NodeBody) -> Result<Vec<u8>> {
        let started = self.stats.as_ref().map(|_| Instant::now());
        let bytes = encode_body(body)?;
        if let (Some(stats), Some(started)) = (&self.stats, started) {
            stats.record_serialize(started.elapsed());
        }
        Ok(bytes)
    }

    /// Decodes a body, resolving adjacent node ids through `resolve`.
    pub fn deserialize(
        &self,
        bytes: &[u8],
        resolve: &dyn Fn(NodeId) -> Option<NodeRef>,
    ) -> Result<NodeBody> {
        let started = self.stats.as_ref().map(|_| Instant::now());
        let body = self.decode_body(bytes, resolve)?;
        if let (Some(stats), Some(started)) = (&self.stats, started) {
            stats.record_deserialize(started.elapsed());
        }
        Ok(body)
    }

    fn decode_body(
        &self,
        bytes: &[u8],
        resolve: &dyn Fn(NodeId) -> Option<NodeRef>,
    ) -> Result<NodeBody> {
        let mut cursor = Cursor::new(bytes);
        let id = NodeId(cursor.read_u64()?);
        let label = cursor.read_string()?;
        let layout = self
            .schema
            .node_layout(&label)
            .ok_or_else(|| GraphError::Corruption(format!("node {id} has unknown label {label}")))?;

        let prop_count = cursor.read_u32()? as usize;
        let mut props = Vec::with_capacity(prop_count);
        for _ in 0..prop_count {
            let key = cursor.read_string()?;
            let position = layout.property_position(&key).ok_or_else(|| {
                GraphError::Corruption(format!("node {id} has undeclared property {key}"))
            })?;
            if props.iter().any(|(existing, _)| *existing == position) {
                return Err(GraphError::Corruption(format!(
                    "node {id} repeats property {key}"
                )));
            }
            let tag = cursor.read_u8()?;
            props.push((position, cursor.read_value(tag)?));
        }

        let index = cursor.read_index()?;

        let payload_len = cursor.read_u32()? as usize;
        let mut payload = Vec::with_capacity(payload_len.min(bytes.len()));
        for _ in 0..payload_len {
            let slot = match cursor.read_u8()? {
                TAG_NULL => None,
                TAG_NODE_REF => {
                    let target = NodeId(cursor.read_u64()?);
                    let handle = resolve(target).ok_or_else(|| {
                        GraphError::Corruption(format!(
                            "node {id} references unknown node {target}"
                        ))
                    })?;
                    Some(Slot::Adjacent(handle))
                }
                tag => Some(Slot::Value(cursor.read_value(tag)?)),
            };
            payload.push(slot);
        }
        cursor.ensure_consumed()?;

        let adjacency = NodeAdjacency::from_parts(strides_of(layout), &index, payload)
            .map_err(|reason| GraphError::Corruption(format!("node {id}: {reason}")))?;
        Ok(NodeBody::from_parts(id, Arc::clone(layout), props, adjacency))
    }
}

impl std::fmt::Debug for NodeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCodec")
            .field("stats", &self.stats.is_some())
            .finish_non_exhaustive()
    }
}

/// Reads only the id and label of a stored body.
pub fn decode_header(bytes: &[u8]) -> Result<(NodeId, String)> {
    let mut cursor = Cursor::new(bytes);
    let id = NodeId(cursor.read_u64()?);
    let label = cursor.read_string()?;
    if label.is_empty() {
        return Err(GraphError::Corruption(format!("node {id} has an empty label")));
    }
    Ok((id, label))
}

fn encode_body(body: &NodeBody) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&body.id().0.to_le_bytes());
    write_string(&mut buf, body.label())?;

    let props = body.property_entries();
    write_len(&mut buf, props.len(), "property count")?;
    let keys = body.layout().property_keys();
    for (position, value) in &props {
        write_string(&mut buf, &keys[*position])?;
        write_value(&mut buf, value)?;
    }

    let block = body.adjacency();
    write_index(&mut buf, block.index_width(), &block.index_values())?;

    let payload = block.payload_snapshot();
    write_len(&mut buf, payload.len(), "payload length")?;
    for slot in &payload {
        match slot.as_deref() {
            None => buf.push(TAG_NULL),
            Some(Slot::Adjacent(node)) => {
                buf.push(TAG_NODE_REF);
                buf.extend_from_slice(&node.id().0.to_le_bytes());
            }
            Some(Slot::Value(value)) => write_value(&mut buf, value)?,
        }
    }
    Ok(buf)
}

fn write_index(buf: &mut Vec<u8>, width: IndexWidth, values: &[usize]) -> Result<()> {
    let overflow = || GraphError::InvalidArgument("adjacency index value exceeds its width".into());
    match width {
        IndexWidth::Byte => buf.push(WIDTH_BYTE),
        IndexWidth::Short => buf.push(WIDTH_SHORT),
        IndexWidth::Int => buf.push(WIDTH_INT),
    }
    write_len(buf, values.len(), "index length")?;
    for &value in values {
        match width {
            IndexWidth::Byte => {
                let v: i8 = value.try_into().map_err(|_| overflow())?;
                buf.extend_from_slice(&v.to_le_bytes());
            }
            IndexWidth::Short => {
                let v: i16 = value.try_into().map_err(|_| overflow())?;
                buf.extend_from_slice(&v.to_le_bytes());
            }
            IndexWidth::Int => {
                let v: i32 = value.try_into().map_err(|_| overflow())?;
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
    Ok(())
}

fn write_value(buf: &mut Vec<u8>, value: &PropValue) -> Result<()> {
    match value {
        PropValue::Bool(v) => {
            buf.push(TAG_BOOL);
            buf.push(u8::from(*v));
        }
        PropValue::Int(v) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        PropValue::Float(v) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        PropValue::Str(s) => {
            buf.push(TAG_STRING);
            write_string(buf, s)?;
        }
        PropValue::Bytes(b) => {
            buf.push(TAG_BYTES);
            write_len(buf, b.len(), "byte array length")?;
            buf.extend_from_slice(b);
        }
        PropValue::List(items) => {
            buf.push(TAG_LIST);
            write_len(buf, items.len(), "list length")?;
            for item in items {
                write_value(buf, item)?;
            }
        }
    }
    Ok(())
}

fn write_len(buf: &mut Vec<u8>, len: usize, what: &str) -> Result<()> {
    let len: u32 = len
        .try_into()
        .map_err(|_| GraphError::InvalidArgument(format!("{what} exceeds u32::MAX")))?;
    buf.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn write_string(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    write_len(buf, value.len(), "string length")?;
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

struct Cursor<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, index: 0 }
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.index < len {
            return Err(GraphError::Corruption("unexpected end of node record".into()));
        }
        let start = self.index;
        self.index += len;
        Ok(&self.data[start..start + len])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.read_exact(N)?
            .try_into()
            .map_err(|_| GraphError::Corruption("short read in node record".into()))
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_exact(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_exact(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| GraphError::Corruption("invalid UTF-8 string".into()))
    }

    fn read_index(&mut self) -> Result<Vec<usize>> {
        let width = self.read_u8()?;
        let len = self.read_u32()? as usize;
        let mut values = Vec::with_capacity(len.min(self.data.len()));
        for _ in 0..len {
            let value = match width {
                WIDTH_BYTE => i64::from(i8::from_le_bytes(self.read_array()?)),
                WIDTH_SHORT => i64::from(i16::from_le_bytes(self.read_array()?)),
                WIDTH_INT => i64::from(i32::from_le_bytes(self.read_array()?)),
                other => {
                    return Err(GraphError::Corruption(format!(
                        "unknown adjacency index width: {other}"
                    )))
                }
            };
            let value = usize::try_from(value).map_err(|_| {
                GraphError::Corruption("negative adjacency index entry".into())
            })?;
            values.push(value);
        }
        Ok(values)
    }

    fn read_value(&mut self, tag: u8) -> Result<PropValue> {
        match tag {
            TAG_BOOL => match self.read_u8()? {
                0 => Ok(PropValue::Bool(false)),
                1 => Ok(PropValue::Bool(true)),
                other => Err(GraphError::Corruption(format!(
                    "invalid boolean encoding: {other}"
                ))),
            },
            TAG_INT => Ok(PropValue::Int(i64::from_le_bytes(self.read_array()?))),
            TAG_FLOAT => Ok(PropValue::Float(f64::from_le_bytes(self.read_array()?))),
            TAG_STRING => Ok(PropValue::Str(self.read_string()?)),
            TAG_BYTES => {
                let len = self.read_u32()? as usize;
                Ok(PropValue::Bytes(self.read_exact(len)?.to_vec()))
            }
            TAG_LIST => {
                let len = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(len.min(self.data.len()));
                for _ in 0..len {
                    let tag = self.read_u8()?;
                    items.push(self.read_value(tag)?);
                }
                Ok(PropValue::List(items))
            }
            other => Err(GraphError::Corruption(format!(
                "unknown property value tag: 0x{other:02X}"
            ))),
        }
    }

    fn ensure_consumed(&self) -> Result<()> {
        if self.index != self.data.len() {
            return Err(GraphError::Corruption(
                "unexpected trailing bytes in node record".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_readable_without_schema() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&42u64.to_le_bytes());
        write_string(&mut buf, "METHOD").unwrap();
        buf.extend_from_slice(&[0xFF; 16]);
        let (id, label) = decode_header(&buf).unwrap();
        assert_eq!(id, NodeId(42));
        assert_eq!(label, "METHOD");
    }

    #[test]
    fn truncated_header_is_corruption() {
        let err = decode_header(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, GraphError::Corruption(_)));
    }

    #[test]
    fn nested_lists_survive_value_encoding() {
        let value = PropValue::List(vec![
            PropValue::Int(-4),
            PropValue::List(vec![PropValue::from("a"), PropValue::Bool(true)]),
            PropValue::Bytes(vec![0, 1]),
            PropValue::Float(0.5),
        ]);
        let mut buf = Vec::new();
        write_value(&mut buf, &value).unwrap();
        let mut cursor = Cursor::new(&buf);
        let tag = cursor.read_u8().unwrap();
        assert_eq!(cursor.read_value(tag).unwrap(), value);
        cursor.ensure_consumed().unwrap();
    }

    #[test]
    fn index_keeps_its_width_on_the_wire() {
        let mut buf = Vec::new();
        write_index(&mut buf, IndexWidth::Short, &[0, 300, 300, 0]).unwrap();
        assert_eq!(buf[0], WIDTH_SHORT);
        assert_eq!(buf.len(), 1 + 4 + 4 * 2);
        let mut cursor = Cursor::new(&buf);
        assert_eq!(cursor.read_index().unwrap(), vec![0, 300, 300, 0]);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut cursor = Cursor::new(&[0u8; 0]);
        let err = cursor.read_value(0x7F).unwrap_err();
        assert!(err.to_string().contains("0x7F"));
    }
}
