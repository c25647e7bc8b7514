use crate::router::error::{RouterError, RouterResult};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Upper bound on the JSON header; anything larger is a corrupt frame.
const MAX_HEADER_LEN: usize = 4096;

/// Header of a binary chunk frame:
/// `[u32 BE header_len][JSON header][payload]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkFrameHeader {
    pub transfer_id: String,
    pub chunk_index: u32,
    /// Hex SHA-256 of the payload.
    pub checksum: String,
    pub is_last: bool,
}

pub fn encode_chunk_frame(header: &ChunkFrameHeader, payload: &[u8]) -> RouterResult<Bytes> {
    let header_json = serde_json::to_vec(header)?;
    let mut buf = BytesMut::with_capacity(4 + header_json.len() + payload.len());
    buf.put_u32(header_json.len() as u32);
    buf.put_slice(&header_json);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

pub fn decode_chunk_frame(data: &[u8]) -> RouterResult<(ChunkFrameHeader, Bytes)> {
    if data.len() < 4 {
        return Err(RouterError::BadFrame("frame shorter than prefix".into()));
    }
    let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(RouterError::BadFrame(format!(
            "header length {header_len} exceeds limit"
        )));
    }
    if data.len() < 4 + header_len {
        return Err(RouterError::BadFrame(format!(
            "truncated header: need {header_len}, have {}",
            data.len() - 4
        )));
    }

    let header: ChunkFrameHeader = serde_json::from_slice(&data[4..4 + header_len])
        .map_err(|e| RouterError::BadFrame(format!("bad header JSON: {e}")))?;
    let payload = Bytes::copy_from_slice(&data[4 + header_len..]);
    Ok((header, payload))
}
