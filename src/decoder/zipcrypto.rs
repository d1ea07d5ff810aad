//! Traditional PKWARE ("ZipCrypto") decryption, APPNOTE.TXT section 6.1.
//!
//! It's a weak cipher, but it's what most encrypted ZIP comics are
//! made with.

use std::io;

use crate::result::*;

/// Each encrypted entry's data starts with this many bytes of encryption header.
pub const HEADER_LEN: usize = 12;

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { 0xedb8_8320 ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = crc32_table();

/// One byte of CRC-32, the way the cipher's key schedule wants it.
fn crc32_step(crc: u32, byte: u8) -> u32 {
    (crc >> 8) ^ CRC32_TABLE[((crc ^ u32::from(byte)) & 0xff) as usize]
}

/// The cipher's three-word internal state
#[derive(Clone)]
pub struct ZipCryptoKeys {
    key0: u32,
    key1: u32,
    key2: u32,
}

impl ZipCryptoKeys {
    pub fn new(password: &[u8]) -> Self {
        let mut keys = Self {
            key0: 0x1234_5678,
            key1: 0x2345_6789,
            key2: 0x3456_7890,
        };
        for &b in password {
            keys.update(b);
        }
        keys
    }

    fn update(&mut self, plain: u8) {
        self.key0 = crc32_step(self.key0, plain);
        self.key1 = self
            .key1
            .wrapping_add(self.key0 & 0xff)
            .wrapping_mul(134_775_813)
            .wrapping_add(1);
        self.key2 = crc32_step(self.key2, (self.key1 >> 24) as u8);
    }

    fn stream_byte(&self) -> u8 {
        let temp = (self.key2 | 2) & 0xffff;
        ((temp * (temp ^ 1)) >> 8) as u8
    }

    pub fn decrypt_byte(&mut self, cipher: u8) -> u8 {
        let plain = cipher ^ self.stream_byte();
        self.update(plain);
        plain
    }

    pub fn encrypt_byte(&mut self, plain: u8) -> u8 {
        let cipher = plain ^ self.stream_byte();
        self.update(plain);
        cipher
    }
}

/// Decrypts a ZipCrypto stream whose 12-byte header has already been checked.
pub struct ZipCryptoReader<R> {
    inner: R,
    keys: ZipCryptoKeys,
}

impl<R: io::Read> ZipCryptoReader<R> {
    /// Reads and decrypts the encryption header, checking its last byte
    /// against `check_byte` (the high byte of the entry's CRC-32,
    /// or of its modification time if the entry has a data descriptor).
    ///
    /// A mismatch means the password is wrong.
    pub fn new(mut inner: R, password: &[u8], check_byte: u8) -> ArchiveResult<Self> {
        let mut keys = ZipCryptoKeys::new(password);
        let mut header = [0u8; HEADER_LEN];
        inner.read_exact(&mut header).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                ArchiveError::InvalidArchive("Truncated encryption header")
            }
            _ => ArchiveError::Io(e),
        })?;
        for b in header.iter_mut() {
            *b = keys.decrypt_byte(*b);
        }
        if header[HEADER_LEN - 1] != check_byte {
            return Err(ArchiveError::WrongPassword);
        }
        Ok(Self { inner, keys })
    }
}

impl<R: io::Read> io::Read for ZipCryptoReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        for b in &mut buf[..n] {
            *b = self.keys.decrypt_byte(*b);
        }
        Ok(n)
    }
}
