use std::io::{Error, ErrorKind, Result};

use bincode::{
	config::{Configuration, Fixint, LittleEndian, NoLimit},
	Decode, Encode,
};

/// All on-disk and on-wire structures are little-endian with fixed-width
/// integers.
pub const fn config() -> Configuration<LittleEndian, Fixint, NoLimit> {
	bincode::config::standard()
		.with_fixed_int_encoding()
		.with_little_endian()
}

pub fn from_bytes<T: Decode>(bytes: &[u8]) -> Result<T> {
	bincode::decode_from_slice(bytes, config())
		.map(|(v, _)| v)
		.map_err(|_| Error::new(ErrorKind::InvalidInput, "failed to decode"))
}

pub fn to_bytes<T: Encode>(value: &T) -> Result<Vec<u8>> {
	bincode::encode_to_vec(value, config())
		.map_err(|_| Error::new(ErrorKind::InvalidInput, "failed to encode"))
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn fixed_int_little_endian() {
		let bytes = to_bytes(&0x1234_5678u32).unwrap();
		assert_eq!(bytes, [0x78, 0x56, 0x34, 0x12]);
		assert_eq!(from_bytes::<u32>(&bytes).unwrap(), 0x1234_5678);
	}

	#[test]
	fn short_input_is_an_error() {
		assert!(from_bytes::<u64>(&[1, 2, 3]).is_err());
	}
}
