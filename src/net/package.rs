use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const HEADER_SIZE: usize = 8;

/// Upper bound on a single frame's payload. A header announcing more than
/// this is treated as stream corruption.
pub const MAX_DATA_SIZE: u32 = 8 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("check bit mismatch (tp: 0x{tp:02x}, check: 0x{check:02x})")]
    CheckBit { tp: u8, check: u8 },

    #[error("package data too large: {0} bytes")]
    TooLarge(u32),
}

/// One frame on the control channel: a fixed little-endian header
/// (`length:u32, pid:u16, tp:u8, check:u8` with `check = tp XOR 0xff`)
/// followed by `length` bytes of payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub pid: u16,
    pub tp: u8,
    pub data: Vec<u8>,
}

impl Package {
    pub fn new(tp: u8, pid: u16, data: Vec<u8>) -> Self {
        Self { pid, tp, data }
    }

    /// A reply without payload, echoing the request's packet id.
    pub fn empty(tp: u8, pid: u16) -> Self {
        Self::new(tp, pid, Vec::new())
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.data.len());
        buf.put_u32_le(self.data.len() as u32);
        buf.put_u16_le(self.pid);
        buf.put_u8(self.tp);
        buf.put_u8(self.tp ^ 0xff);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, PackageError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).await?;

        let mut header = &header[..];
        let length = header.get_u32_le();
        let pid = header.get_u16_le();
        let tp = header.get_u8();
        let check = header.get_u8();

        if tp ^ 0xff != check {
            return Err(PackageError::CheckBit { tp, check });
        }
        if length > MAX_DATA_SIZE {
            return Err(PackageError::TooLarge(length));
        }

        let mut data = vec![0u8; length as usize];
        reader.read_exact(&mut data).await?;
        Ok(Self { pid, tp, data })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn round_trip() {
        let pkg = Package::new(0x42, 517, b"{\"probes\":[]}".to_vec());
        let bytes = pkg.to_bytes();

        let mut reader = bytes.as_ref();
        let decoded = Package::read_from(&mut reader).await.unwrap();
        assert_eq!(decoded, pkg);
    }

    #[tokio::test]
    async fn empty_payload_round_trip() {
        let pkg = Package::empty(0x40, 1);
        let bytes = pkg.to_bytes();

        let mut reader = bytes.as_ref();
        let decoded = Package::read_from(&mut reader).await.unwrap();
        assert_eq!(decoded.data, Vec::<u8>::new());
        assert_eq!(decoded.pid, 1);
    }

    #[tokio::test]
    async fn check_bit_mismatch_is_rejected() {
        let mut bytes = Package::empty(0x40, 1).to_bytes().to_vec();
        bytes[7] ^= 0x01;

        let mut reader = bytes.as_slice();
        let err = Package::read_from(&mut reader).await.unwrap_err();
        assert_matches!(err, PackageError::CheckBit { tp: 0x40, .. });
    }

    #[tokio::test]
    async fn oversized_header_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(MAX_DATA_SIZE + 1);
        buf.put_u16_le(0);
        buf.put_u8(0x41);
        buf.put_u8(0x41 ^ 0xff);

        let bytes = buf.freeze();
        let mut reader = bytes.as_ref();
        let err = Package::read_from(&mut reader).await.unwrap_err();
        assert_matches!(err, PackageError::TooLarge(_));
    }

    #[tokio::test]
    async fn truncated_stream_is_io_error() {
        let bytes = Package::new(0x42, 9, vec![1, 2, 3, 4]).to_bytes();
        let mut reader = &bytes[..bytes.len() - 2];
        let err = Package::read_from(&mut reader).await.unwrap_err();
        assert_matches!(err, PackageError::Io(_));
    }
}
