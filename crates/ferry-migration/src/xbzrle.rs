//! XBZRLE: delta encoding of a buffer against an earlier copy of itself.
//!
//! The encoding is a sequence of `(zero run, non-zero run)` pairs. Each run length is a small
//! unsigned LEB128 (at most two bytes, so at most 14 bits), and each non-zero run length is
//! followed by that many literal bytes from the new buffer. "Zero" refers to the XOR of old and
//! new, i.e. unchanged bytes. A trailing zero run is never written.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum XbzrleError {
    /// The encoding would not fit the destination; send the data uncompressed instead.
    #[error("encoded data exceeds the destination buffer")]
    Overflow,

    #[error("malformed XBZRLE data: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoded {
    /// `old` and `new` are identical; nothing needs to be sent.
    Unchanged,
    /// Number of bytes written to the destination.
    Delta(usize),
}

/// Largest run length representable by the two-byte LEB128 form.
pub const MAX_RUN: usize = 0x3fff;

const WORD: usize = std::mem::size_of::<u64>();
const ONES: u64 = 0x0101_0101_0101_0101;
const HIGHS: u64 = ONES << 7;

fn word(buf: &[u8], i: usize) -> u64 {
    let mut w = [0u8; WORD];
    w.copy_from_slice(&buf[i..i + WORD]);
    u64::from_ne_bytes(w)
}

// Nonzero iff some byte of `x` is zero.
fn has_zero_byte(x: u64) -> bool {
    x.wrapping_sub(ONES) & !x & HIGHS != 0
}

fn uleb128_encode_small(out: &mut [u8], n: usize) -> usize {
    if n < 0x80 {
        out[0] = n as u8;
        1
    } else {
        out[0] = (n & 0x7f) as u8 | 0x80;
        out[1] = (n >> 7) as u8;
        2
    }
}

fn uleb128_decode_small(input: &[u8]) -> Result<(usize, usize), XbzrleError> {
    let first = *input
        .first()
        .ok_or(XbzrleError::Malformed("truncated run length"))?;
    if first & 0x80 == 0 {
        return Ok((first as usize, 1));
    }
    let second = *input
        .get(1)
        .ok_or(XbzrleError::Malformed("truncated run length"))?;
    if second & 0x80 != 0 {
        return Err(XbzrleError::Malformed("run length exceeds 14 bits"));
    }
    Ok(((first & 0x7f) as usize | (second as usize) << 7, 2))
}

/// Encode `new` against `old` into `dst`.
///
/// `old` and `new` must have the same length, at most [`MAX_RUN`] bytes.
pub fn encode_buffer(old: &[u8], new: &[u8], dst: &mut [u8]) -> Result<Encoded, XbzrleError> {
    if old.len() != new.len() {
        return Err(XbzrleError::Malformed("buffers differ in length"));
    }
    let slen = new.len();
    if slen > MAX_RUN {
        return Err(XbzrleError::Malformed("buffer too large"));
    }
    let dlen = dst.len();

    let mut d = 0;
    let mut i = 0;
    let mut zrun_len = 0;

    while i < slen {
        if d + 2 > dlen {
            return Err(XbzrleError::Overflow);
        }

        // Bytes until the remainder is a whole number of words.
        let mut res = (slen - i) % WORD;
        while res > 0 && old[i] == new[i] {
            zrun_len += 1;
            i += 1;
            res -= 1;
        }
        if res == 0 {
            while i < slen && word(old, i) == word(new, i) {
                i += WORD;
                zrun_len += WORD;
            }
            while i < slen && old[i] == new[i] {
                zrun_len += 1;
                i += 1;
            }
        }

        if zrun_len == slen {
            return Ok(Encoded::Unchanged);
        }
        if i == slen {
            return Ok(Encoded::Delta(d));
        }

        d += uleb128_encode_small(&mut dst[d..], zrun_len);
        zrun_len = 0;
        let nzrun_start = i;

        if d + 2 > dlen {
            return Err(XbzrleError::Overflow);
        }

        let mut res = (slen - i) % WORD;
        while res > 0 && old[i] != new[i] {
            i += 1;
            res -= 1;
        }
        if res == 0 {
            while i < slen {
                if has_zero_byte(word(old, i) ^ word(new, i)) {
                    // The run ends inside this word.
                    while i < slen && old[i] != new[i] {
                        i += 1;
                    }
                    break;
                }
                i += WORD;
            }
        }

        let nzrun_len = i - nzrun_start;
        d += uleb128_encode_small(&mut dst[d..], nzrun_len);
        if d + nzrun_len > dlen {
            return Err(XbzrleError::Overflow);
        }
        dst[d..d + nzrun_len].copy_from_slice(&new[nzrun_start..i]);
        d += nzrun_len;
    }

    Ok(Encoded::Delta(d))
}

/// Apply `src` onto `dst`, which must already hold the old contents. Returns the number of
/// destination bytes covered by the runs.
pub fn decode_buffer(src: &[u8], dst: &mut [u8]) -> Result<usize, XbzrleError> {
    let slen = src.len();
    let dlen = dst.len();
    let mut i = 0;
    let mut d = 0;

    while i < slen {
        if slen - i < 2 {
            return Err(XbzrleError::Malformed("truncated zero run"));
        }
        let (count, used) = uleb128_decode_small(&src[i..])?;
        if i != 0 && count == 0 {
            return Err(XbzrleError::Malformed("empty zero run"));
        }
        i += used;
        d += count;
        if d > dlen {
            return Err(XbzrleError::Malformed("zero run past end of buffer"));
        }

        if slen - i < 2 {
            return Err(XbzrleError::Malformed("truncated data run"));
        }
        let (count, used) = uleb128_decode_small(&src[i..])?;
        if count == 0 {
            return Err(XbzrleError::Malformed("empty data run"));
        }
        i += used;
        if d + count > dlen || i + count > slen {
            return Err(XbzrleError::Malformed("data run past end of buffer"));
        }
        dst[d..d + count].copy_from_slice(&src[i..i + count]);
        d += count;
        i += count;
    }

    Ok(d)
}
