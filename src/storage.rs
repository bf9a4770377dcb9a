use std::fmt::Debug;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::AcquisitionError;

/// Read-only view of procfs, sysfs and device files
///
/// Paths are relative to the filesystem root (`proc/cpuinfo`,
/// `sys/devices/...`), so the whole monitor can run against a fake tree.
pub trait StorageReader: Debug + Send + Sync {
	/// Reads a whole file into a string
	fn read_to_string(&self, path: &Path) -> io::Result<String>;

	/// Lists entry names of a directory, sorted
	fn list_dir(&self, path: &Path) -> io::Result<Vec<String>>;

	/// Opens a file for random-access reads
	fn open(&self, path: &Path) -> io::Result<File>;

	/// Returns whether a path is a symbolic link; fails when the path does not exist
	fn is_symlink(&self, path: &Path) -> io::Result<bool>;
}

/// [`StorageReader`] backed by the real filesystem under `root`
#[derive(Debug, Clone)]
pub struct SysfsReader {
	root: PathBuf,
}

impl SysfsReader {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	fn resolve(&self, path: &Path) -> PathBuf {
		// Absolute paths (e.g. user supplied event definitions) bypass the root.
		if path.is_absolute() {
			path.to_path_buf()
		} else {
			self.root.join(path)
		}
	}
}

impl Default for SysfsReader {
	fn default() -> Self {
		Self::new("/")
	}
}

impl StorageReader for SysfsReader {
	fn read_to_string(&self, path: &Path) -> io::Result<String> {
		fs::read_to_string(self.resolve(path))
	}

	fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
		let mut names: Vec<String> = fs::read_dir(self.resolve(path))?
			.filter_map(Result::ok)
			.map(|entry| entry.file_name().to_string_lossy().into_owned())
			.collect();
		names.sort();
		Ok(names)
	}

	fn open(&self, path: &Path) -> io::Result<File> {
		File::open(self.resolve(path))
	}

	fn is_symlink(&self, path: &Path) -> io::Result<bool> {
		Ok(fs::symlink_metadata(self.resolve(path))?.file_type().is_symlink())
	}
}

/// Reads a single-value pseudo-file and parses its trimmed contents
pub fn read_value<T: FromStr>(reader: &dyn StorageReader, path: &Path) -> Result<T, AcquisitionError> {
	let content = reader
		.read_to_string(path)
		.map_err(|source| AcquisitionError::io(path, source))?;
	let value = content.trim();
	value.parse().map_err(|_| AcquisitionError::Parse {
		path: path.to_path_buf(),
		value: value.to_string(),
	})
}
