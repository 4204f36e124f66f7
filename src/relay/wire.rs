//! Fixed-layout wire protocol
//!
//! Every message on every connection is one of two little-endian records:
//! a [`RequestHeader`] followed by exactly `payload_size` payload bytes in
//! the sender-to-server direction, and a [`Response`] in the other. There
//! are no magic bytes and no version negotiation; peer pairing is
//! established entirely by who connects to whom.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::SiteId;

/// Serialized size of a [`RequestHeader`]: seq + site_id + payload_size.
pub const REQUEST_HEADER_SIZE: usize = 8 + 4 + 8;

/// Serialized size of a [`Response`]: seq + site_id.
pub const RESPONSE_SIZE: usize = 8 + 4;

/// Prefix of every sender-to-server message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub seq: u64,
    pub site_id: SiteId,
    pub payload_size: u64,
}

impl RequestHeader {
    pub fn encode(&self) -> [u8; REQUEST_HEADER_SIZE] {
        let mut buf = [0u8; REQUEST_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..12].copy_from_slice(&self.site_id.to_le_bytes());
        buf[12..20].copy_from_slice(&self.payload_size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; REQUEST_HEADER_SIZE]) -> Self {
        Self {
            seq: u64_at(buf, 0),
            site_id: u32_at(buf, 8),
            payload_size: u64_at(buf, 12),
        }
    }
}

/// Per-message acknowledgement written by a server worker after the user
/// callback has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub seq: u64,
    pub site_id: SiteId,
}

impl Response {
    pub fn encode(&self) -> [u8; RESPONSE_SIZE] {
        let mut buf = [0u8; RESPONSE_SIZE];
        buf[0..8].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..12].copy_from_slice(&self.site_id.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; RESPONSE_SIZE]) -> Self {
        Self {
            seq: u64_at(buf, 0),
            site_id: u32_at(buf, 8),
        }
    }
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

/// Write one framed request: header, then the payload bytes.
///
/// Transfers everything or fails the connection; a partial write leaves the
/// stream unusable for further framing.
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &RequestHeader,
    payload: &[u8],
) -> io::Result<()> {
    writer.write_all(&header.encode()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Read one request header. A short read is unrecoverable for the stream.
pub async fn read_request_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<RequestHeader> {
    let mut buf = [0u8; REQUEST_HEADER_SIZE];
    reader.read_exact(&mut buf).await?;
    Ok(RequestHeader::decode(&buf))
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> io::Result<()> {
    writer.write_all(&response.encode()).await?;
    Ok(())
}

pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Response> {
    let mut buf = [0u8; RESPONSE_SIZE];
    reader.read_exact(&mut buf).await?;
    Ok(Response::decode(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_layout() {
        let header = RequestHeader {
            seq: 0x0102_0304_0506_0708,
            site_id: 0x0a0b_0c0d,
            payload_size: 3,
        };
        let buf = header.encode();
        // Little-endian field order: seq, site_id, payload_size.
        assert_eq!(&buf[0..8], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[8..12], &[0x0d, 0x0c, 0x0b, 0x0a]);
        assert_eq!(&buf[12..20], &[3, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(RequestHeader::decode(&buf), header);
    }

    #[test]
    fn test_response_layout() {
        let response = Response { seq: 7, site_id: 2 };
        let buf = response.encode();
        assert_eq!(buf.len(), RESPONSE_SIZE);
        assert_eq!(&buf[0..8], &[7, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[8..12], &[2, 0, 0, 0]);
        assert_eq!(Response::decode(&buf), response);
    }

    #[tokio::test]
    async fn test_framed_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(256);

        let header = RequestHeader { seq: 0, site_id: 1, payload_size: 3 };
        write_request(&mut client, &header, b"ABC").await.unwrap();

        let got = read_request_header(&mut server).await.unwrap();
        assert_eq!(got, header);
        let mut payload = [0u8; 3];
        server.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"ABC");

        write_response(&mut server, &Response { seq: 0, site_id: 2 }).await.unwrap();
        let res = read_response(&mut client).await.unwrap();
        assert_eq!(res, Response { seq: 0, site_id: 2 });
    }
}
