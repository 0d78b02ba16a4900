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

use tsumiki_common::{cal_object_idx, cal_object_offset, ChunkOffset, ObjectIndex, ObjectOffset};

/// [IoPiece] is the part of a chunk request that falls into one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoPiece {
    pub object:     ObjectIndex,
    /// [offset] inside the object.
    pub offset:     ObjectOffset,
    pub length:     u64,
    /// [buf_offset] is where this piece starts in the caller's buffer.
    pub buf_offset: u64,
}

/// Cut `[offset, offset + length)` of a chunk into per object pieces, in
/// increasing object order.
///
/// There are always `last - first + 1` pieces, where `last` is the object
/// holding `offset + length`. When the range ends exactly on an object
/// boundary the final piece is therefore empty; callers skip it.
pub fn split_range(offset: ChunkOffset, length: u64, object_size: u64) -> Vec<IoPiece> {
    let end = offset + length;
    let first_obj = cal_object_idx(offset, object_size);
    let first_off = cal_object_offset(offset, object_size);
    let last_obj = cal_object_idx(end, object_size);
    let last_off = cal_object_offset(end, object_size);

    let mut pieces = Vec::with_capacity((last_obj - first_obj + 1) as usize);
    let mut buf_offset = 0;
    for object in first_obj..=last_obj {
        let (op_offset, op_length) = if first_obj == last_obj {
            (first_off, length)
        } else if object == first_obj {
            (first_off, object_size - first_off)
        } else if object == last_obj {
            (0, last_off)
        } else {
            (0, object_size)
        };
        pieces.push(IoPiece {
            object,
            offset: op_offset,
            length: op_length,
            buf_offset,
        });
        buf_offset += op_length;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_three_objects() {
        let pieces = split_range(3996, 5000, 4096);
        assert_eq!(pieces.len(), 3);
        assert_eq!(
            pieces[0],
            IoPiece {
                object:     0,
                offset:     3996,
                length:     100,
                buf_offset: 0,
            }
        );
        assert_eq!((pieces[1].object, pieces[1].offset, pieces[1].length), (1, 0, 4096));
        assert_eq!((pieces[2].object, pieces[2].offset, pieces[2].length), (2, 0, 804));
        assert_eq!(pieces[2].buf_offset, 4196);
    }

    #[test]
    fn two_objects() {
        // object_size - 100 .. object_size + 4096 - 100
        let pieces = split_range(3996, 4196, 4096);
        assert_eq!(pieces.len(), 2);
        assert_eq!((pieces[0].object, pieces[0].offset, pieces[0].length), (0, 3996, 100));
        assert_eq!((pieces[1].object, pieces[1].offset, pieces[1].length), (1, 0, 4096));
    }

    #[test]
    fn inside_one_object() {
        let pieces = split_range(10, 20, 4096);
        assert_eq!(
            pieces,
            vec![IoPiece {
                object:     0,
                offset:     10,
                length:     20,
                buf_offset: 0,
            }]
        );
    }

    #[test]
    fn empty_tail_on_boundary() {
        let pieces = split_range(0, 4096, 4096);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].length, 4096);
        assert_eq!((pieces[1].object, pieces[1].length), (1, 0));

        let pieces = split_range(4000, 96, 4096);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].length, 96);
        assert_eq!(pieces[1].length, 0);
    }

    #[test]
    fn partitions_every_range() {
        let object_size = 64;
        let chunk_size = 4 * object_size;
        for offset in 0..chunk_size {
            for length in 0..=(chunk_size - offset) {
                let pieces = split_range(offset, length, object_size);
                let first = offset / object_size;
                let last = (offset + length) / object_size;
                assert_eq!(pieces.len() as u64, last - first + 1);

                let mut pos = offset;
                let mut total = 0;
                for p in &pieces {
                    assert_eq!(p.object * object_size + p.offset, pos);
                    assert!(p.offset + p.length <= object_size);
                    assert_eq!(p.buf_offset, total);
                    pos += p.length;
                    total += p.length;
                }
                assert_eq!(total, length);
            }
        }
    }
}
