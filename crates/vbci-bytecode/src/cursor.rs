// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),
    #[error("malformed LEB128 sequence at byte {0}")]
    BadLeb(usize),
}

/// A little-endian byte cursor over a program file or code blob.
#[derive(Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Cursor<'a> {
        Cursor { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], CursorError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(CursorError::UnexpectedEof(self.pos))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CursorError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u32_le(&mut self) -> Result<u32, CursorError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64_le(&mut self) -> Result<u64, CursorError> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn uleb(&mut self) -> Result<u64, CursorError> {
        let start = self.pos;
        let mut slice = &self.buf[self.pos.min(self.buf.len())..];
        let before = slice.len();
        let v = leb128::read::unsigned(&mut slice).map_err(|e| match e {
            leb128::read::Error::IoError(_) => CursorError::UnexpectedEof(start),
            leb128::read::Error::Overflow => CursorError::BadLeb(start),
        })?;
        self.pos += before - slice.len();
        Ok(v)
    }

    pub fn sleb(&mut self) -> Result<i64, CursorError> {
        let start = self.pos;
        let mut slice = &self.buf[self.pos.min(self.buf.len())..];
        let before = slice.len();
        let v = leb128::read::signed(&mut slice).map_err(|e| match e {
            leb128::read::Error::IoError(_) => CursorError::UnexpectedEof(start),
            leb128::read::Error::Overflow => CursorError::BadLeb(start),
        })?;
        self.pos += before - slice.len();
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_reads() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        buf.extend_from_slice(&42u64.to_le_bytes());
        let mut c = Cursor::new(&buf);
        assert_eq!(c.u32_le().unwrap(), 0xDEAD_BEEF);
        assert_eq!(c.u64_le().unwrap(), 42);
        assert!(c.at_end());
        assert_eq!(c.u8(), Err(CursorError::UnexpectedEof(12)));
    }

    #[test]
    fn leb_round_trip() {
        let mut buf = Vec::new();
        leb128::write::unsigned(&mut buf, 624_485).unwrap();
        leb128::write::signed(&mut buf, -123_456).unwrap();
        let mut c = Cursor::new(&buf);
        assert_eq!(c.uleb().unwrap(), 624_485);
        assert_eq!(c.sleb().unwrap(), -123_456);
        assert!(c.at_end());
    }
}
