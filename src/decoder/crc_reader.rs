//! Optional CRC-32 validation of decoded zip entries

use std::io;
use std::io::prelude::*;

use crc32fast::Hasher;

/// Reader that validates the CRC32 when it reaches the EOF.
///
/// Zip CRCs are ignored by default (plenty of comic archives in the wild
/// carry bogus ones); sessions opt in with `Options::verify_crc`.
pub struct Crc32Reader<R> {
    inner: R,
    hasher: Hasher,
    expected: u32,
}

impl<R> Crc32Reader<R> {
    pub fn new(inner: R, expected: u32) -> Crc32Reader<R> {
        Crc32Reader {
            inner,
            hasher: Hasher::new(),
            expected,
        }
    }

    fn actual(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

impl<R: Read> Read for Crc32Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        if count == 0 && !buf.is_empty() && self.actual() != self.expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Invalid checksum: expected {:08x}, got {:08x}",
                    self.expected,
                    self.actual()
                ),
            ));
        }
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty_reader() {
        let data: &[u8] = b"";
        let mut buf = [0; 1];

        let mut reader = Crc32Reader::new(data, 0);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);

        let mut reader = Crc32Reader::new(data, 1);
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("Invalid checksum"));
    }

    #[test]
    fn test_whole_entry() {
        let mut reader = Crc32Reader::new(&b"1234"[..], 0x9be3e0a3);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"1234");
    }

    #[test]
    fn test_corrupt_entry() {
        let mut reader = Crc32Reader::new(&b"1235"[..], 0x9be3e0a3);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }
}
