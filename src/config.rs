//! Constants and runtime parameters of the balloon driver.

use alloc::string::{String, ToString};

use thiserror::Error;

/// Number of allocator pages reported per round when the host does not
/// understand chunks. The flat array therefore holds `ARRAY_PAGES_MAX * K`
/// balloon PFNs.
pub const ARRAY_PAGES_MAX: usize = 256;

/// Balloon PFNs released per out of memory notification.
pub const OOM_DEFAULT_PAGES: u32 = 256;

/// Priority the driver registers its OOM notifier with.
pub const OOM_NOTIFY_PRIORITY: i32 = 80;

/// Bytes per bitmap window.
pub const PAGE_BMAP_SIZE: usize = 8 * 4096;

/// Upper bound of bitmap windows alive during one batch.
pub const PAGE_BMAP_COUNT_MAX: usize = 32;

/// Chunk descriptors collected before the buffer is flushed eagerly.
pub const MAX_PAGE_CHUNKS: usize = 4096;

/// Shift applied to a chunk's base PFN on the wire.
pub const CHUNK_BASE_SHIFT: u32 = 12;

/// Shift applied to a chunk's length on the wire.
pub const CHUNK_SIZE_SHIFT: u32 = 12;

/// Delay before the next fill attempt once the allocator ran dry.
pub const FILL_BACKOFF_MS: u64 = 200;

const PREFIX: &str = "balloon.";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
	#[error("unable to split balloon parameters")]
	Split,
	#[error("invalid value {value:?} for balloon.{key}")]
	InvalidValue { key: String, value: String },
	#[error("balloon.{key}={value} is out of range")]
	OutOfRange { key: &'static str, value: u64 },
}

/// Runtime parameters of a [`VirtioBalloonDriver`](crate::VirtioBalloonDriver).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalloonConfig {
	/// Balloon PFNs to deflate when the system runs out of memory.
	pub oom_pages: u32,
	/// Delay in milliseconds after the allocator could not supply a page.
	pub backoff_ms: u64,
	/// Chunk descriptors per buffer.
	pub max_chunks: usize,
	/// Size of one bitmap window in bytes, a multiple of eight.
	pub bitmap_window_bytes: usize,
	/// Maximum number of bitmap windows.
	pub max_bitmap_windows: usize,
	/// Allocator pages per legacy PFN array.
	pub array_pages: usize,
}

impl Default for BalloonConfig {
	fn default() -> Self {
		Self {
			oom_pages: OOM_DEFAULT_PAGES,
			backoff_ms: FILL_BACKOFF_MS,
			max_chunks: MAX_PAGE_CHUNKS,
			bitmap_window_bytes: PAGE_BMAP_SIZE,
			max_bitmap_windows: PAGE_BMAP_COUNT_MAX,
			array_pages: ARRAY_PAGES_MAX,
		}
	}
}

impl BalloonConfig {
	/// Parses the `balloon.*` parameters of a kernel command line.
	///
	/// Tokens belonging to other subsystems are skipped, unknown `balloon.*`
	/// keys are reported and ignored.
	pub fn from_cmdline(cmdline: &str) -> Result<Self, ConfigError> {
		let mut config = Self::default();
		let words = shell_words::split(cmdline).map_err(|_| ConfigError::Split)?;

		for word in &words {
			let Some(param) = word.strip_prefix(PREFIX) else {
				continue;
			};
			let Some((key, value)) = param.split_once('=') else {
				warn!("<balloon> Ignoring parameter without value: {word}");
				continue;
			};

			match key {
				"oom_pages" => config.oom_pages = parse(key, value)?,
				"backoff_ms" => config.backoff_ms = parse(key, value)?,
				"max_chunks" => config.max_chunks = parse(key, value)?,
				"bitmap_window_bytes" => config.bitmap_window_bytes = parse(key, value)?,
				"max_bitmap_windows" => config.max_bitmap_windows = parse(key, value)?,
				"array_pages" => config.array_pages = parse(key, value)?,
				_ => warn!("<balloon> Ignoring unknown parameter {word}"),
			}
		}

		config.validate()?;
		debug!("<balloon> Parameters: {config:?}");
		Ok(config)
	}

	/// Checks the limits the encoders rely on.
	pub fn validate(&self) -> Result<(), ConfigError> {
		let nonzero = [
			("max_chunks", self.max_chunks),
			("max_bitmap_windows", self.max_bitmap_windows),
			("array_pages", self.array_pages),
		];
		for (key, value) in nonzero {
			if value == 0 {
				return Err(ConfigError::OutOfRange { key, value: 0 });
			}
		}

		if self.bitmap_window_bytes == 0 || self.bitmap_window_bytes % 8 != 0 {
			return Err(ConfigError::OutOfRange {
				key: "bitmap_window_bytes",
				value: self.bitmap_window_bytes as u64,
			});
		}

		Ok(())
	}
}

fn parse<T: core::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
	value.parse().map_err(|_| ConfigError::InvalidValue {
		key: key.to_string(),
		value: value.to_string(),
	})
}
