//! Builds test archives in memory, so the tests don't need any tools installed.

#![allow(dead_code)]

use std::fs::File;
use std::io::{Cursor, Seek, SeekFrom, Write};

use anyhow::Result;
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use liblzma::write::XzEncoder;

use rars::{ArchiveVersion, Builder};
use zesven::{ArchivePath, WriteOptions, Writer};

use seekarc::decoder::zipcrypto::{ZipCryptoKeys, HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Stored,
    Deflated,
}

/// A file to put in a test zip
pub struct ZipFile<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
    pub method: Method,
    pub password: Option<&'a str>,
    /// Lie about the uncompressed size, if set.
    pub declared_size: Option<u32>,
}

impl<'a> ZipFile<'a> {
    pub fn stored(name: &'a str, data: &'a [u8]) -> Self {
        Self {
            name,
            data,
            method: Method::Stored,
            password: None,
            declared_size: None,
        }
    }

    pub fn deflated(name: &'a str, data: &'a [u8]) -> Self {
        Self {
            method: Method::Deflated,
            ..Self::stored(name, data)
        }
    }

    pub fn encrypted(mut self, password: &'a str) -> Self {
        self.password = Some(password);
        self
    }
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Traditional PKWARE encryption: a 12-byte header whose last byte
/// is the high byte of the CRC, then the (compressed) data.
fn encrypt(password: &str, crc: u32, data: &[u8]) -> Vec<u8> {
    let mut keys = ZipCryptoKeys::new(password.as_bytes());
    let mut header = [0x5au8; HEADER_LEN];
    header[HEADER_LEN - 1] = (crc >> 24) as u8;
    header
        .iter()
        .chain(data)
        .map(|&b| keys.encrypt_byte(b))
        .collect()
}

/// Builds a zip archive.
pub fn zip(files: &[ZipFile]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut central = Vec::new();
    for file in files {
        let offset = out.len() as u32;
        let crc = crc32fast::hash(file.data);
        let (method, mut payload) = match file.method {
            Method::Stored => (0u16, file.data.to_vec()),
            Method::Deflated => (8u16, deflate(file.data)),
        };
        let mut flags = 1u16 << 11; // UTF-8 names
        if let Some(password) = file.password {
            payload = encrypt(password, crc, &payload);
            flags |= 1;
        }
        let size = file.declared_size.unwrap_or(file.data.len() as u32);
        let name = file.name.as_bytes();

        // Local file header
        out.extend_from_slice(b"PK\x03\x04");
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&method.to_le_bytes());
        out.extend_from_slice(&0x6000u16.to_le_bytes()); // 12:00
        out.extend_from_slice(&0x5221u16.to_le_bytes()); // 2021-01-01
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&payload);

        // Central directory entry, made by Unix so the mode bits count
        central.extend_from_slice(b"PK\x01\x02");
        central.extend_from_slice(&0x0314u16.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&flags.to_le_bytes());
        central.extend_from_slice(&method.to_le_bytes());
        central.extend_from_slice(&0x6000u16.to_le_bytes());
        central.extend_from_slice(&0x5221u16.to_le_bytes());
        central.extend_from_slice(&crc.to_le_bytes());
        central.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        central.extend_from_slice(&size.to_le_bytes());
        central.extend_from_slice(&(name.len() as u16).to_le_bytes());
        central.extend_from_slice(&[0; 8]); // extra, comment, disk, internal attributes
        let mode: u32 = if file.name.ends_with('/') { 0o040755 } else { 0o100644 };
        central.extend_from_slice(&(mode << 16).to_le_bytes());
        central.extend_from_slice(&offset.to_le_bytes());
        central.extend_from_slice(name);
    }

    let central_offset = out.len() as u32;
    out.extend_from_slice(&central);
    out.extend_from_slice(b"PK\x05\x06");
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&(files.len() as u16).to_le_bytes());
    out.extend_from_slice(&(files.len() as u16).to_le_bytes());
    out.extend_from_slice(&(central.len() as u32).to_le_bytes());
    out.extend_from_slice(&central_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

fn tar_header(name: &str, typeflag: u8, size: usize) -> [u8; 512] {
    let mut h = [0u8; 512];
    h[..name.len()].copy_from_slice(name.as_bytes());
    h[100..108].copy_from_slice(b"0000644\0");
    h[124..136].copy_from_slice(format!("{:011o}\0", size).as_bytes());
    h[136..148].copy_from_slice(b"14000000000\0");
    h[156] = typeflag;
    h[257..263].copy_from_slice(b"ustar\0");
    h[263..265].copy_from_slice(b"00");
    let sum: u32 = h
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { 32 } else { b as u32 })
        .sum();
    h[148..156].copy_from_slice(format!("{:06o}\0 ", sum).as_bytes());
    h
}

/// Builds a tarball. Names ending in `/` become directories.
pub fn tar(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, data) in files {
        let typeflag = if name.ends_with('/') { b'5' } else { b'0' };
        out.extend_from_slice(&tar_header(name, typeflag, data.len()));
        out.extend_from_slice(data);
        let padded = (out.len() + 511) / 512 * 512;
        out.resize(padded, 0);
    }
    out.extend_from_slice(&[0; 1024]);
    out
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn xz(data: &[u8]) -> Vec<u8> {
    let mut encoder = XzEncoder::new(Vec::new(), 6);
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Builds a 7z archive, with its file data AES-encrypted if given a password.
/// Names stay readable either way.
pub fn seven_zip(files: &[(&str, &[u8])], password: Option<&str>) -> Vec<u8> {
    let mut options = WriteOptions::new();
    if let Some(password) = password {
        options = options.password(password).encrypt_data(true);
    }
    let mut writer = Writer::create(Cursor::new(Vec::new()))
        .unwrap()
        .options(options);
    for (name, data) in files {
        writer.add_bytes(ArchivePath::new(name).unwrap(), data).unwrap();
    }
    let (_result, cursor) = writer.finish_into_inner().unwrap();
    cursor.into_inner()
}

/// Builds a RAR 5 archive, encrypting file data if given a password.
pub fn rar(files: &[(&str, &[u8])], password: Option<&str>) -> Vec<u8> {
    let mut builder =
        Builder::new(ArchiveVersion::Rar50).password(password.map(|p| p.as_bytes().to_vec()));
    for (name, data) in files {
        builder
            .add_bytes(name.as_bytes().to_vec(), data.to_vec(), None, None)
            .unwrap();
    }
    builder.to_bytes().unwrap()
}

/// Writes `bytes` to a temporary file, returning it rewound.
pub fn temp_archive(bytes: &[u8]) -> Result<File> {
    let mut file = tempfile::tempfile()?;
    file.write_all(bytes)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

/// Some bytes that look nothing like their neighbors
pub fn page(i: usize, len: usize) -> Vec<u8> {
    (0..len)
        .map(|j| (j.wrapping_mul(31) ^ i.wrapping_mul(97) ^ (j >> 7)) as u8)
        .collect()
}

/// A comic's worth of pages plus the usual clutter
pub fn comic_files(pages: &[Vec<u8>]) -> Vec<(String, Vec<u8>)> {
    let mut files = vec![(String::from("ComicInfo.xml"), b"<ComicInfo/>".to_vec())];
    for (i, data) in pages.iter().enumerate() {
        let ext = ["jpg", "png", "webp"][i % 3];
        files.push((format!("pages/{:02}.{}", i + 1, ext), data.clone()));
        if i == 1 {
            files.push((String::from("pages/Thumbs.db"), vec![0; 17]));
        }
    }
    files
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
