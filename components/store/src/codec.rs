// Copyright 2024 tsumiki
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Little endian, unpadded field packing shared by the on-disk records.

use byteorder::{ByteOrder, LittleEndian};

#[derive(Default)]
pub(crate) struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub(crate) fn with_capacity(n: usize) -> Self { Self { buf: Vec::with_capacity(n) } }

    pub(crate) fn put_u8(&mut self, v: u8) { self.buf.push(v); }

    pub(crate) fn put_u16(&mut self, v: u16) {
        let mut b = [0u8; 2];
        LittleEndian::write_u16(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub(crate) fn put_u64(&mut self, v: u64) {
        let mut b = [0u8; 8];
        LittleEndian::write_u64(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub(crate) fn put_bytes(&mut self, v: &[u8]) { self.buf.extend_from_slice(v); }

    /// Write `v` into a zero padded field of `width` bytes, truncating it if
    /// needed so that at least one NUL remains.
    pub(crate) fn put_fixed_str(&mut self, v: &str, width: usize) {
        let bytes = v.as_bytes();
        let n = bytes.len().min(width.saturating_sub(1));
        self.buf.extend_from_slice(&bytes[..n]);
        self.buf.resize(self.buf.len() + width - n, 0);
    }

    pub(crate) fn len(&self) -> usize { self.buf.len() }

    pub(crate) fn finish(self) -> Vec<u8> { self.buf }
}

/// Reads fields off a slice. Every getter returns `None` once the slice
/// runs out.
pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self { Self { buf, pos: 0 } }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let s = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(s)
    }

    pub(crate) fn get_u8(&mut self) -> Option<u8> { self.take(1).map(|b| b[0]) }

    pub(crate) fn get_u16(&mut self) -> Option<u16> { self.take(2).map(LittleEndian::read_u16) }

    pub(crate) fn get_u32(&mut self) -> Option<u32> { self.take(4).map(LittleEndian::read_u32) }

    pub(crate) fn get_u64(&mut self) -> Option<u64> { self.take(8).map(LittleEndian::read_u64) }

    pub(crate) fn get_fixed_str(&mut self, width: usize) -> Option<String> {
        let raw = self.take(width)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Some(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields() {
        let mut enc = Encoder::default();
        enc.put_u8(1);
        enc.put_u16(0x0203);
        enc.put_u32(0x04050607);
        enc.put_u64(u64::MAX - 1);
        enc.put_fixed_str("cluster", 16);
        assert_eq!(enc.len(), 1 + 2 + 4 + 8 + 16);
        let buf = enc.finish();
        assert_eq!(&buf[1..3], &[0x03, 0x02]);

        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.get_u8(), Some(1));
        assert_eq!(dec.get_u16(), Some(0x0203));
        assert_eq!(dec.get_u32(), Some(0x04050607));
        assert_eq!(dec.get_u64(), Some(u64::MAX - 1));
        assert_eq!(dec.get_fixed_str(16).as_deref(), Some("cluster"));
        assert_eq!(dec.get_u8(), None);
    }

    #[test]
    fn long_string_keeps_a_nul() {
        let mut enc = Encoder::default();
        enc.put_fixed_str("abcdef", 4);
        assert_eq!(enc.finish(), b"abc\0");
    }
}
