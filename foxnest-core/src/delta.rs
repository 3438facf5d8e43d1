//! Copy/insert delta codec
//!
//! A delta describes a target buffer as a sequence of operations against a base:
//!
//! ```text
//! varint base_len
//! varint target_len
//! ( 0x01 varint offset varint len      copy base[offset..offset+len]
//! | 0x00 varint len <len bytes>        insert literal bytes )*
//! ```
//!
//! The encoder indexes the base in fixed 16-byte blocks and greedily extends
//! every block hit forwards and backwards.

use std::collections::HashMap;

const OP_INSERT: u8 = 0x00;
const OP_COPY: u8 = 0x01;

/// Granularity of the base index; shorter matches are emitted as literals.
pub const BLOCK_SIZE: usize = 16;

/// Errors raised while applying a malformed delta
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    #[error("delta truncated at byte {0}")]
    Truncated(usize),

    #[error("delta expects a base of {expected} bytes, got {actual}")]
    BaseLength { expected: u64, actual: u64 },

    #[error("copy of {len} bytes at offset {offset} exceeds base of {base_len} bytes")]
    CopyOutOfRange { offset: u64, len: u64, base_len: u64 },

    #[error("unknown delta opcode {0:#04x}")]
    UnknownOp(u8),

    #[error("delta produced {actual} bytes, header declared {expected}")]
    ResultLength { expected: u64, actual: u64 },
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64, DeltaError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos).ok_or(DeltaError::Truncated(*pos))?;
        *pos += 1;
        if shift >= 64 {
            return Err(DeltaError::Truncated(*pos));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn emit_insert(out: &mut Vec<u8>, literal: &[u8]) {
    if literal.is_empty() {
        return;
    }
    out.push(OP_INSERT);
    write_varint(out, literal.len() as u64);
    out.extend_from_slice(literal);
}

fn emit_copy(out: &mut Vec<u8>, offset: usize, len: usize) {
    out.push(OP_COPY);
    write_varint(out, offset as u64);
    write_varint(out, len as u64);
}

/// Encode `target` as edits against `base`
pub fn encode(base: &[u8], target: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(target.len() / 4 + 16);
    write_varint(&mut out, base.len() as u64);
    write_varint(&mut out, target.len() as u64);

    let mut index: HashMap<&[u8], usize> = HashMap::new();
    let mut offset = 0;
    while offset + BLOCK_SIZE <= base.len() {
        index.entry(&base[offset..offset + BLOCK_SIZE]).or_insert(offset);
        offset += BLOCK_SIZE;
    }

    let mut literal_start = 0;
    let mut pos = 0;
    while pos + BLOCK_SIZE <= target.len() {
        let Some(&base_off) = index.get(&target[pos..pos + BLOCK_SIZE]) else {
            pos += 1;
            continue;
        };

        let mut len = BLOCK_SIZE;
        while base_off + len < base.len()
            && pos + len < target.len()
            && base[base_off + len] == target[pos + len]
        {
            len += 1;
        }

        let mut back = 0;
        while back < pos - literal_start
            && back < base_off
            && base[base_off - back - 1] == target[pos - back - 1]
        {
            back += 1;
        }

        let start = pos - back;
        emit_insert(&mut out, &target[literal_start..start]);
        emit_copy(&mut out, base_off - back, len + back);
        pos = start + len + back;
        literal_start = pos;
    }
    emit_insert(&mut out, &target[literal_start..]);
    out
}

/// Reconstruct the target from `base` and a delta produced by [`encode`]
pub fn apply(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut pos = 0;
    let base_len = read_varint(delta, &mut pos)?;
    if base_len != base.len() as u64 {
        return Err(DeltaError::BaseLength {
            expected: base_len,
            actual: base.len() as u64,
        });
    }
    let target_len = read_varint(delta, &mut pos)?;
    let mut out = Vec::with_capacity(target_len.min(1 << 30) as usize);

    while pos < delta.len() {
        let op = delta[pos];
        pos += 1;
        match op {
            OP_COPY => {
                let offset = read_varint(delta, &mut pos)?;
                let len = read_varint(delta, &mut pos)?;
                let end = offset.checked_add(len).filter(|end| *end <= base.len() as u64);
                let Some(end) = end else {
                    return Err(DeltaError::CopyOutOfRange {
                        offset,
                        len,
                        base_len: base.len() as u64,
                    });
                };
                out.extend_from_slice(&base[offset as usize..end as usize]);
            }
            OP_INSERT => {
                let len = read_varint(delta, &mut pos)? as usize;
                let end = pos.checked_add(len).filter(|end| *end <= delta.len());
                let Some(end) = end else {
                    return Err(DeltaError::Truncated(delta.len()));
                };
                out.extend_from_slice(&delta[pos..end]);
                pos = end;
            }
            other => return Err(DeltaError::UnknownOp(other)),
        }
        if out.len() as u64 > target_len {
            break;
        }
    }

    if out.len() as u64 != target_len {
        return Err(DeltaError::ResultLength {
            expected: target_len,
            actual: out.len() as u64,
        });
    }
    Ok(out)
}
