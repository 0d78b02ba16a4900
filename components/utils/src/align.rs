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

pub fn is_aligned(n: u64, align: u64) -> bool { n % align == 0 }

/// A zeroed byte buffer whose first byte sits on an `align` boundary.
///
/// Used for `O_DIRECT` transfers, which reject buffers that are not aligned
/// to the logical block size of the device.
pub struct AlignedBuf {
    raw:   Vec<u8>,
    start: usize,
    len:   usize,
}

impl AlignedBuf {
    pub fn zeroed(len: usize, align: usize) -> Self {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        let raw = vec![0u8; len + align];
        let addr = raw.as_ptr() as usize;
        let start = (align - addr % align) % align;
        Self { raw, start, len }
    }

    /// Copy `data` into a fresh aligned buffer of the same length.
    pub fn copy_from(data: &[u8], align: usize) -> Self {
        let mut buf = Self::zeroed(data.len(), align);
        buf.as_mut_slice().copy_from_slice(data);
        buf
    }

    pub fn len(&self) -> usize { self.len }

    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn as_slice(&self) -> &[u8] { &self.raw[self.start..self.start + self.len] }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.start..self.start + self.len]
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_buffer() {
        for len in [0usize, 1, 4095, 4096, 8192 + 7] {
            let buf = AlignedBuf::zeroed(len, 4096);
            assert_eq!(buf.len(), len);
            assert_eq!(buf.as_slice().as_ptr() as usize % 4096, 0);
            assert!(buf.as_slice().iter().all(|b| *b == 0));
        }

        let buf = AlignedBuf::copy_from(b"hello", 512);
        assert_eq!(buf.as_slice(), b"hello");
        assert_eq!(buf.as_slice().as_ptr() as usize % 512, 0);
    }

    #[test]
    fn alignment() {
        assert!(is_aligned(0, 4096));
        assert!(is_aligned(8192, 4096));
        assert!(!is_aligned(100, 512));
    }
}
