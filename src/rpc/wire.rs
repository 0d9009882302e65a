//! RPC message envelope: a one-byte length-of-length (1..8), that many
//! big-endian length bytes, then the payload. Shared by the JSON and
//! binary RPC variants.

use crate::error::{SuilError, SuilResult};
use crate::runtime::deadline_after;
use crate::sock::SocketAdaptor;

/// Prefix an encoded payload length with the minimal big-endian
/// representation.
pub fn encode_envelope(payload: &[u8], out: &mut Vec<u8>) {
    let len = payload.len() as u64;
    let be = len.to_be_bytes();
    let skip = be.iter().take_while(|b| **b == 0).count().min(7);
    out.push((8 - skip) as u8);
    out.extend_from_slice(&be[skip..]);
    out.extend_from_slice(payload);
}

/// Decode an envelope from `data`. Returns `(payload_range, consumed)`
/// when a full message is available.
pub fn decode_envelope(data: &[u8], limit: usize) -> SuilResult<Option<(usize, usize)>> {
    if data.is_empty() {
        return Ok(None);
    }
    let lol = data[0] as usize;
    if lol == 0 || lol > 8 {
        return Err(SuilError::proto(format!(
            "invalid length-of-length byte {lol}"
        )));
    }
    if data.len() < 1 + lol {
        return Ok(None);
    }
    let mut len: u64 = 0;
    for b in &data[1..1 + lol] {
        len = len << 8 | *b as u64;
    }
    let len = len as usize;
    if len > limit {
        return Err(SuilError::proto(format!(
            "message of {len} bytes exceeds the {limit} byte limit"
        )));
    }
    if data.len() < 1 + lol + len {
        return Ok(None);
    }
    Ok(Some((1 + lol, 1 + lol + len)))
}

/// Send one framed message.
pub async fn send_framed(
    sock: &mut impl SocketAdaptor,
    payload: &[u8],
    timeout: i64,
) -> SuilResult<()> {
    let deadline = deadline_after(timeout);
    let mut framed = Vec::with_capacity(payload.len() + 9);
    encode_envelope(payload, &mut framed);
    sock.send(&framed, deadline).await?;
    sock.flush(deadline).await
}

/// Receive one framed message. `Ok(None)` is a clean end of stream
/// between messages.
pub async fn recv_framed(
    sock: &mut impl SocketAdaptor,
    limit: usize,
    timeout: i64,
) -> SuilResult<Option<Vec<u8>>> {
    let deadline = deadline_after(timeout);
    let mut acc: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some((start, end)) = decode_envelope(&acc, limit)? {
            // Exchanges are strictly sequential, so nothing trails a
            // complete message.
            return Ok(Some(acc[start..end].to_vec()));
        }
        let n = sock.recv(&mut buf, deadline).await?;
        if n == 0 {
            if acc.is_empty() {
                return Ok(None);
            }
            return Err(SuilError::Closed);
        }
        acc.extend_from_slice(&buf[..n]);
    }
}
