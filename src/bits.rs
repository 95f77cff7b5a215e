use crate::{Error, Result};

/// Read `bit_count` bits starting at `bit_offset` as a big-endian unsigned
/// integer. Bit 0 is the most significant bit of `buf[0]`.
///
/// # Errors
/// [Error::NotEnoughData] if the requested bits extend past the end of `buf`.
///
/// # Panics
/// If `bit_count` is greater than 64.
pub(crate) fn read_uint(buf: &[u8], bit_offset: usize, bit_count: usize) -> Result<u64> {
    assert!(bit_count <= 64, "bit_count must fit a u64");
    let end = bit_offset + bit_count;
    if end > buf.len() * 8 {
        return Err(Error::NotEnoughData {
            actual: buf.len(),
            minimum: end.div_ceil(8),
        });
    }

    let mut val: u64 = 0;
    for bit in bit_offset..end {
        let b = buf[bit / 8] >> (7 - bit % 8);
        val = val << 1 | u64::from(b & 1);
    }
    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_bytes() {
        let dat = [0x12, 0x34, 0x56];
        assert_eq!(read_uint(&dat, 0, 8).unwrap(), 0x12);
        assert_eq!(read_uint(&dat, 0, 16).unwrap(), 0x1234);
        assert_eq!(read_uint(&dat, 8, 16).unwrap(), 0x3456);
    }

    #[test]
    fn unaligned_field_spanning_byte_boundary() {
        let dat = [0b1010_1100, 0b0101_0011];
        assert_eq!(read_uint(&dat, 4, 8).unwrap(), 0b1100_0101);
        assert_eq!(read_uint(&dat, 1, 3).unwrap(), 0b010);
        assert_eq!(read_uint(&dat, 7, 2).unwrap(), 0b00);
    }

    #[test]
    fn virtual_channel_id_field() {
        // vcid 1 lives in bits 12..15 of the frame primary header
        let dat = [0x01, 0x02];
        assert_eq!(read_uint(&dat, 12, 3).unwrap(), 1);
    }

    #[test]
    fn zero_width_read_is_zero() {
        assert_eq!(read_uint(&[0xff], 3, 0).unwrap(), 0);
    }

    #[test]
    fn out_of_range_is_err() {
        let zult = read_uint(&[0xff, 0xff], 9, 8);
        assert!(matches!(
            zult,
            Err(Error::NotEnoughData {
                actual: 2,
                minimum: 3
            })
        ));
    }
}
