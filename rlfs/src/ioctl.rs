use std::mem::size_of;

use nix::{ioctl_none, ioctl_read, ioctl_readwrite, ioctl_write_ptr};

use crate::data::{CpMode, Cpstat, Sustat};

/// Descriptor of an array argument to an array-typed kernel request.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Argv {
	pub base: u64,
	pub nmembs: u32,
	pub size: u16,
	pub flags: u16,
	pub index: u64,
}

impl Argv {
	pub fn from_slice<T>(items: &[T]) -> Self {
		Self {
			base: items.as_ptr() as u64,
			nmembs: items.len() as u32,
			size: size_of::<T>() as u16,
			flags: 0,
			index: 0,
		}
	}

	pub fn from_mut_slice<T>(items: &mut [T]) -> Self {
		Self {
			base: items.as_mut_ptr() as u64,
			nmembs: items.len() as u32,
			size: size_of::<T>() as u16,
			flags: 0,
			index: 0,
		}
	}
}

const IOC_MAGIC: u8 = b'L';

ioctl_write_ptr!(change_cpmode, IOC_MAGIC, 0x80, CpMode);
ioctl_write_ptr!(delete_checkpoint, IOC_MAGIC, 0x81, u64);
ioctl_readwrite!(get_cpinfo, IOC_MAGIC, 0x82, Argv);
ioctl_read!(get_cpstat, IOC_MAGIC, 0x83, Cpstat);
ioctl_readwrite!(get_suinfo, IOC_MAGIC, 0x84, Argv);
ioctl_read!(get_sustat, IOC_MAGIC, 0x85, Sustat);
ioctl_readwrite!(get_vinfo, IOC_MAGIC, 0x86, Argv);
ioctl_readwrite!(get_bdescs, IOC_MAGIC, 0x87, Argv);
ioctl_write_ptr!(clean_segments, IOC_MAGIC, 0x88, [Argv; 5]);
ioctl_read!(sync_fs, IOC_MAGIC, 0x8a, u64);
ioctl_write_ptr!(resize, IOC_MAGIC, 0x8b, u64);
ioctl_write_ptr!(set_alloc_range, IOC_MAGIC, 0x8c, [u64; 2]);
ioctl_write_ptr!(set_suinfo, IOC_MAGIC, 0x8d, Argv);
ioctl_none!(freeze, IOC_MAGIC, 0x8e);
ioctl_none!(thaw, IOC_MAGIC, 0x8f);

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn argv_describes_slice() {
		let items = [0u64; 7];
		let argv = Argv::from_slice(&items);
		assert_eq!(argv.base, items.as_ptr() as u64);
		assert_eq!(argv.nmembs, 7);
		assert_eq!(argv.size, 8);
	}
}
