//! Length-prefixed response envelope for onion request protocol v4.
//!
//! Wire shape: `l<len>:<json-headers>e`, or with a body,
//! `l<len>:<json-headers><len>:<body>e`. The headers object carries the
//! destination status under `"code"`.

use crate::error::{Error, Result};

/// A decoded v4 envelope.
#[derive(Debug, Clone)]
pub struct DecodedEnvelope {
    /// Header object; `"code"` holds the destination status.
    pub headers: serde_json::Value,
    /// Optional body segment.
    pub body: Option<Vec<u8>>,
}

impl DecodedEnvelope {
    /// Destination status from the headers, when present.
    pub fn status(&self) -> Option<u16> {
        self.headers
            .get("code")
            .and_then(|v| v.as_u64())
            .and_then(|code| u16::try_from(code).ok())
    }
}

/// Encode headers and an optional body into a v4 envelope.
pub fn encode(headers: &serde_json::Value, body: Option<&[u8]>) -> Result<Vec<u8>> {
    let header_bytes = serde_json::to_vec(headers)?;
    let mut out = Vec::with_capacity(header_bytes.len() + body.map_or(0, <[u8]>::len) + 16);
    out.push(b'l');
    out.extend_from_slice(header_bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(&header_bytes);
    if let Some(body) = body {
        out.extend_from_slice(body.len().to_string().as_bytes());
        out.push(b':');
        out.extend_from_slice(body);
    }
    out.push(b'e');
    Ok(out)
}

/// Decode a v4 envelope.
pub fn decode(data: &[u8]) -> Result<DecodedEnvelope> {
    if data.len() < 3 || data[0] != b'l' || data[data.len() - 1] != b'e' {
        return Err(Error::InvalidResponse("not a v4 envelope".into()));
    }
    let inner = &data[1..data.len() - 1];

    let (headers_segment, rest) = read_segment(inner)?;
    let headers = serde_json::from_slice(headers_segment)
        .map_err(|e| Error::InvalidResponse(format!("envelope headers: {e}")))?;

    let body = if rest.is_empty() {
        None
    } else {
        let (body_segment, tail) = read_segment(rest)?;
        if !tail.is_empty() {
            return Err(Error::InvalidResponse("trailing envelope data".into()));
        }
        Some(body_segment.to_vec())
    };

    Ok(DecodedEnvelope { headers, body })
}

/// Read one `<len>:<bytes>` segment, returning the segment and the rest.
fn read_segment(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let colon = data
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| Error::InvalidResponse("missing segment length".into()))?;
    let len: usize = std::str::from_utf8(&data[..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::InvalidResponse("bad segment length".into()))?;
    let start = colon + 1;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| Error::InvalidResponse("segment length out of bounds".into()))?;
    Ok((&data[start..end], &data[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_headers_only() {
        let encoded = encode(&json!({"code": 200}), None).expect("encode");
        assert_eq!(encoded, b"l12:{\"code\":200}e");

        let decoded = decode(&encoded).expect("decode");
        assert_eq!(decoded.status(), Some(200));
        assert!(decoded.body.is_none());
    }

    #[test]
    fn test_headers_and_body() {
        let encoded =
            encode(&json!({"code": 200}), Some(b"{\"hash\":\"abc\"}")).expect("encode");
        let decoded = decode(&encoded).expect("decode");
        assert_eq!(decoded.status(), Some(200));
        assert_eq!(decoded.body.as_deref(), Some(&b"{\"hash\":\"abc\"}"[..]));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(decode(b"").is_err());
        assert!(decode(b"le").is_err());
        assert!(decode(b"l5:{}e").is_err()); // length overruns
        assert!(decode(b"x2:{}e").is_err()); // wrong framing
        assert!(decode(b"l2:{}9:shorte").is_err()); // body overruns
    }

    #[test]
    fn test_rejects_trailing_garbage() {
        let mut encoded = encode(&json!({"code": 200}), Some(b"ok")).expect("encode");
        let end = encoded.len() - 1;
        encoded.splice(end..end, b"1:x".iter().copied());
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn test_status_absent() {
        let decoded = decode(&encode(&json!({}), None).expect("encode")).expect("decode");
        assert_eq!(decoded.status(), None);
    }
}
