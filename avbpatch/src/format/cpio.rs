// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, io};

use bstr::ByteSlice;
use num_traits::ToPrimitive;
use thiserror::Error;

use crate::{format::padding, stream::SliceReader, util::NumBytes};

const MAGIC_NEW: &[u8; 6] = b"070701";
const MAGIC_NEW_CRC: &[u8; 6] = b"070702";

const CPIO_TRAILER: &[u8; 10] = b"TRAILER!!!";

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

const IO_BLOCK_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 6]),
    #[error("Hard links are not supported: {:?}", .0.as_bstr())]
    HardLinksNotSupported(Vec<u8>),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Invalid hex digits in {0:?} field: {data:?}", data = .1.as_bstr())]
    InvalidHex(&'static str, Vec<u8>),
    #[error("Filename is not NULL-terminated: {:?}", .0.as_bstr())]
    NameNotTerminated(Vec<u8>),
    #[error("Failed to read cpio data")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Read u32 formatted as an ASCII 8-char wide hex string.
fn read_int(reader: &mut SliceReader, field: &'static str) -> Result<u32> {
    let buf = reader.read_array::<8>()?;
    let mut value = 0;

    for b in buf {
        let digit = (b as char)
            .to_digit(16)
            .ok_or_else(|| Error::InvalidHex(field, buf.to_vec()))?;

        value <<= 4;
        value |= digit;
    }

    Ok(value)
}

/// Write u32 formatted as an ASCII 8-char wide hex string.
fn write_int(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(format!("{value:08x}").as_bytes());
}

fn file_type(mode: u32) -> u32 {
    mode & 0o170000
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct CpioEntryNew {
    pub ino: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mtime: u32,
    pub dev_maj: u32,
    pub dev_min: u32,
    pub rdev_maj: u32,
    pub rdev_min: u32,
    pub chksum: u32,
    pub name: Vec<u8>,
    pub content: Vec<u8>,
}

impl fmt::Debug for CpioEntryNew {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpioEntryNew")
            .field("ino", &self.ino)
            .field("mode", &format_args!("{:o}", self.mode))
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("nlink", &self.nlink)
            .field("mtime", &self.mtime)
            .field("chksum", &self.chksum)
            .field("name", &self.name.as_bstr())
            .field("content", &NumBytes(self.content.len()))
            .finish()
    }
}

impl CpioEntryNew {
    pub fn new_trailer() -> Self {
        Self {
            // Must be 1 for CRC format.
            nlink: 1,
            name: CPIO_TRAILER.to_vec(),
            ..Default::default()
        }
    }

    pub fn new_symlink(link_target: &[u8], name: &[u8]) -> Self {
        Self {
            mode: S_IFLNK | 0o777,
            nlink: 1,
            name: name.to_owned(),
            content: link_target.to_owned(),
            ..Default::default()
        }
    }

    pub fn new_directory(name: &[u8], perms: u32) -> Self {
        Self {
            mode: S_IFDIR | perms,
            nlink: 1,
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn new_file(name: &[u8], perms: u32, content: Vec<u8>) -> Self {
        Self {
            mode: S_IFREG | perms,
            nlink: 1,
            name: name.to_owned(),
            content,
            ..Default::default()
        }
    }

    pub fn is_file(&self) -> bool {
        file_type(self.mode) == S_IFREG
    }

    /// Parse an entry. Alignment is relative to the start of the archive,
    /// which is the start of the reader's underlying slice.
    fn decode(reader: &mut SliceReader) -> Result<Self> {
        let magic = reader.read_array::<6>()?;
        if magic != *MAGIC_NEW && magic != *MAGIC_NEW_CRC {
            return Err(Error::UnknownMagic(magic));
        }

        let ino = read_int(reader, "ino")?;
        let mode = read_int(reader, "mode")?;
        let uid = read_int(reader, "uid")?;
        let gid = read_int(reader, "gid")?;
        let nlink = read_int(reader, "nlink")?;
        let mtime = read_int(reader, "mtime")?;
        let filesize = read_int(reader, "filesize")?;
        let dev_maj = read_int(reader, "dev_maj")?;
        let dev_min = read_int(reader, "dev_min")?;
        let rdev_maj = read_int(reader, "rdev_maj")?;
        let rdev_min = read_int(reader, "rdev_min")?;
        let namesize = read_int(reader, "namesize")?;
        let chksum = read_int(reader, "chksum")?;

        let namesize = namesize
            .to_usize()
            .ok_or(Error::IntegerTooLarge("namesize"))?;
        let mut name = reader.read_slice(namesize)?.to_vec();
        if name.last() != Some(&b'\0') {
            return Err(Error::NameNotTerminated(name));
        }
        name.pop();
        reader.read_padding(4)?;

        let filesize = filesize
            .to_usize()
            .ok_or(Error::IntegerTooLarge("filesize"))?;
        let content = reader.read_slice(filesize)?.to_vec();
        reader.read_padding(4)?;

        Ok(Self {
            ino,
            mode,
            uid,
            gid,
            nlink,
            mtime,
            dev_maj,
            dev_min,
            rdev_maj,
            rdev_min,
            chksum,
            name,
            content,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let filesize = self
            .content
            .len()
            .to_u32()
            .ok_or(Error::IntegerTooLarge("filesize"))?;
        let namesize = self
            .name
            .len()
            .checked_add(1)
            .and_then(|s| s.to_u32())
            .ok_or(Error::IntegerTooLarge("namesize"))?;

        if self.chksum == 0 {
            buf.extend_from_slice(MAGIC_NEW);
        } else {
            buf.extend_from_slice(MAGIC_NEW_CRC);
        }

        for value in [
            self.ino,
            self.mode,
            self.uid,
            self.gid,
            self.nlink,
            self.mtime,
            filesize,
            self.dev_maj,
            self.dev_min,
            self.rdev_maj,
            self.rdev_min,
            namesize,
            self.chksum,
        ] {
            write_int(buf, value);
        }

        buf.extend_from_slice(&self.name);
        buf.push(0);
        padding::pad_vec(buf, 4);

        buf.extend_from_slice(&self.content);
        padding::pad_vec(buf, 4);

        Ok(())
    }
}

/// Parse all entries of a newc archive. Anything after the trailer entry is
/// ignored.
pub fn load(data: &[u8], include_trailer: bool) -> Result<Vec<CpioEntryNew>> {
    let mut reader = SliceReader::new(data);
    let mut entries = vec![];

    loop {
        let entry = CpioEntryNew::decode(&mut reader)?;
        if file_type(entry.mode) != S_IFDIR && entry.nlink > 1 {
            return Err(Error::HardLinksNotSupported(entry.name));
        }

        if entry.name == CPIO_TRAILER {
            if include_trailer {
                entries.push(entry);
            }
            break;
        }

        entries.push(entry);
    }

    Ok(entries)
}

pub fn sort(entries: &mut [CpioEntryNew]) {
    entries.sort_by(|a, b| a.name.cmp(&b.name));
}

pub fn reassign_inodes(entries: &mut [CpioEntryNew]) {
    let mut inode = 300000;

    for entry in entries {
        entry.ino = inode;
        inode += 1;
    }
}

pub fn save(entries: &[CpioEntryNew], pad_to_block_size: bool) -> Result<Vec<u8>> {
    let mut buf = Vec::new();

    for entry in entries {
        entry.encode(&mut buf)?;
    }

    let mut trailer = CpioEntryNew::new_trailer();
    // 1 higher than the highest inode if possible.
    trailer.ino = entries
        .iter()
        .map(|e| e.ino)
        .max()
        .map_or(0, |i| i.saturating_add(1));
    trailer.encode(&mut buf)?;

    // Pad until the end of the block.
    if pad_to_block_size {
        padding::pad_vec(&mut buf, IO_BLOCK_SIZE);
    }

    Ok(buf)
}
