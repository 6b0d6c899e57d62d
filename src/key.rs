//! Packing of port tuples into 64-bit lookup keys.
//!
//! Each port is stored as its offset from the range base in one byte, first
//! port in the most significant byte. This bounds the range to 256 ports and a
//! tuple to 8 ports, and makes a tuple usable as a plain integer map key.

/// Port number.
pub type Port = u16;

/// Ordered sequence of ports, knocked first to last.
pub type Tuple = Vec<Port>;

/// Packed tuple identity.
pub type Key = u64;

/// Bits used per port offset.
pub const PORT_BITS: u32 = 8;
/// Ports that fit into one key.
pub const MAX_TUPLE_LEN: usize = (Key::BITS / PORT_BITS) as usize;
/// Mask selecting one port offset.
pub const PORT_MASK: Key = (1 << PORT_BITS) - 1;
/// Largest range a single base can address.
pub const MAX_RANGE_SIZE: usize = 1 << PORT_BITS;

/// Encode `tuple` relative to `base`.
///
/// Ports past `MAX_TUPLE_LEN` are ignored.
pub fn encode(base: Port, tuple: &[Port]) -> Key {
    tuple.iter().take(MAX_TUPLE_LEN).fold(0, |key, &port| {
        let offset = Key::from(port.wrapping_sub(base)) & PORT_MASK;
        (key << PORT_BITS) | offset
    })
}

/// Decode `key` back into `MAX_TUPLE_LEN` ports relative to `base`.
///
/// A tuple shorter than `MAX_TUPLE_LEN` comes back left-padded with `base`;
/// the caller must know the real length.
pub fn decode(base: Port, key: Key) -> Tuple {
    let top = Key::BITS - PORT_BITS;
    (0..MAX_TUPLE_LEN)
        .map(|i| {
            let offset = (key << (i as u32 * PORT_BITS)) >> top;
            base.wrapping_add(offset as Port)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_msb_first() {
        assert_eq!(encode(1, &[2, 3, 4, 5, 6, 7, 8, 9]), 0x0102030405060708);
    }

    #[test]
    fn base_ports_encode_to_zero() {
        assert_eq!(encode(1, &[1; 8]), 0);
    }

    #[test]
    fn decodes_full_tuple() {
        assert_eq!(decode(1, 0x0102030405060708), vec![2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn truncates_long_tuples() {
        let long = [10, 11, 12, 13, 14, 15, 16, 17, 18, 19];
        assert_eq!(encode(10, &long), encode(10, &long[..MAX_TUPLE_LEN]));
    }

    #[test]
    fn short_tuple_occupies_low_bytes() {
        let key = encode(21380, &[21380, 21381, 21382, 21383]);
        assert_eq!(key, 0x00010203);
        assert_eq!(&decode(21380, key)[4..], &[21380, 21381, 21382, 21383]);
    }

    #[test]
    fn full_range_round_trips() {
        let base = 40000;
        let tuple: Tuple = vec![40000, 40255, 40128, 40001, 40254, 40017, 40099, 40200];
        assert_eq!(decode(base, encode(base, &tuple)), tuple);
    }

    #[test]
    fn order_is_significant() {
        assert_ne!(encode(0, &[1, 2, 3]), encode(0, &[3, 2, 1]));
    }
}
