use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// Byte-addressable register device, such as `/dev/cpu/N/msr`
pub trait RegisterSource: Send + Sync {
	/// Reads the 64-bit register stored at `offset`
	fn read_register(&self, offset: u64) -> io::Result<u64>;
}

impl RegisterSource for File {
	fn read_register(&self, offset: u64) -> io::Result<u64> {
		read_msr(self, offset)
	}
}

/// Reads a value from a Model-Specific Register (MSR)
///
/// # Arguments
///
/// * `device` - The opened register device of one CPU
/// * `offset` - The address of the MSR to read
///
/// # Returns
///
/// The little-endian value read from the device, or an io::Error if fewer than 8 bytes could be read
pub fn read_msr(device: &File, offset: u64) -> io::Result<u64> {
	let mut buf = [0u8; 8];
	device.read_exact_at(&mut buf, offset)?;
	Ok(u64::from_le_bytes(buf))
}
