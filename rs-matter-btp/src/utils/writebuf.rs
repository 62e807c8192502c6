/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

use crate::error::*;
use byteorder::{ByteOrder, LittleEndian};

/// A bounded, append-only little-endian writer over a borrowed byte slice.
///
/// Used for encoding BTP headers, handshake payloads and fragments.
#[derive(Debug)]
pub struct WriteBuf<'a> {
    buf: &'a mut [u8],
    end: usize,
}

impl<'a> WriteBuf<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, end: 0 }
    }

    pub fn get_tail(&self) -> usize {
        self.end
    }

    /// Space left before the writer reaches the end of the slice.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.end
    }

    pub fn rewind_tail_to(&mut self, new_end: usize) {
        self.end = new_end;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.end]
    }

    pub fn reset(&mut self) {
        self.end = 0;
    }

    pub fn append_with<F>(&mut self, size: usize, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Self),
    {
        if self.end + size <= self.buf.len() {
            f(self);
            self.end += size;
            return Ok(());
        }
        Err(ErrorCode::NoSpace.into())
    }

    pub fn append(&mut self, src: &[u8]) -> Result<(), Error> {
        self.append_with(src.len(), |x| {
            x.buf[x.end..(x.end + src.len())].copy_from_slice(src);
        })
    }

    pub fn le_u8(&mut self, data: u8) -> Result<(), Error> {
        self.append_with(1, |x| {
            x.buf[x.end] = data;
        })
    }

    pub fn le_u16(&mut self, data: u16) -> Result<(), Error> {
        self.append_with(2, |x| {
            LittleEndian::write_u16(&mut x.buf[x.end..], data);
        })
    }

    pub fn le_u32(&mut self, data: u32) -> Result<(), Error> {
        self.append_with(4, |x| {
            LittleEndian::write_u32(&mut x.buf[x.end..], data);
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::utils::writebuf::*;

    #[test]
    fn test_append_le_with_success() {
        let mut test_slice = [0; 10];
        let mut buf = WriteBuf::new(&mut test_slice);

        buf.le_u8(1).unwrap();
        buf.le_u16(65).unwrap();
        buf.le_u32(0xcafebabe).unwrap();
        buf.append(&[0xaa, 0xbb]).unwrap();
        assert_eq!(buf.remaining(), 1);
        assert_eq!(
            test_slice,
            [1, 65, 0, 0xbe, 0xba, 0xfe, 0xca, 0xaa, 0xbb, 0]
        );
    }

    #[test]
    fn test_overrun() {
        let mut test_slice = [0; 3];
        let mut buf = WriteBuf::new(&mut test_slice);
        buf.le_u16(0xcafe).unwrap();

        // Only one byte left, so none of these must touch the buffer
        assert!(buf.le_u16(65).is_err());
        assert!(buf.le_u32(0xcafebabe).is_err());
        assert!(buf.append(&[1, 2]).is_err());
        assert_eq!(buf.as_slice(), [0xfe, 0xca]);

        buf.le_u8(7).unwrap();
        assert_eq!(buf.le_u8(8).map_err(|e| e.code()), Err(ErrorCode::NoSpace));
    }

    #[test]
    fn test_rewind_tail() {
        let mut test_slice = [0; 20];
        let mut buf = WriteBuf::new(&mut test_slice);

        buf.le_u16(65).unwrap();

        let anchor = buf.get_tail();

        buf.append(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee]).unwrap();
        assert_eq!(buf.as_slice(), [65, 0, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);

        buf.rewind_tail_to(anchor);
        buf.le_u16(66).unwrap();
        assert_eq!(buf.as_slice(), [65, 0, 66, 0]);

        buf.reset();
        assert!(buf.as_slice().is_empty());
    }
}
