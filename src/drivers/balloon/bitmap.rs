use alloc::collections::TryReserveError;
use alloc::vec::Vec;

use bitvec::prelude::*;

/// One window of the pool. Bit `i` stands for the PFN `pass start + i`.
pub(crate) type Window = BitVec<u64, Lsb0>;

/// Bitmap windows that together describe one pass over a PFN span.
///
/// The first window lives as long as the pool. Further windows are added for
/// the duration of a single batch and released once it is reported.
#[derive(Debug)]
pub(crate) struct BitmapPool {
	windows: Vec<Window>,
	window_bits: u64,
	max_windows: usize,
}

impl BitmapPool {
	pub fn try_new(window_bytes: usize, max_windows: usize) -> Result<Self, TryReserveError> {
		let window_bits = (window_bytes as u64).saturating_mul(8);
		let mut windows = Vec::new();
		windows.try_reserve_exact(max_windows)?;
		windows.push(Self::try_window(window_bits)?);

		Ok(Self {
			windows,
			window_bits,
			max_windows,
		})
	}

	fn try_window(bits: u64) -> Result<Window, TryReserveError> {
		let words = (bits / u64::BITS as u64) as usize;
		let mut storage = Vec::new();
		storage.try_reserve_exact(words)?;
		storage.resize(words, 0u64);
		Ok(Window::from_vec(storage))
	}

	pub fn window_bits(&self) -> u64 {
		self.window_bits
	}

	pub fn len(&self) -> usize {
		self.windows.len()
	}

	/// PFNs one pass can cover with the windows currently allocated.
	pub fn pass_bits(&self) -> u64 {
		self.window_bits.saturating_mul(self.windows.len() as u64)
	}

	/// Adds windows until `span` PFNs fit or the cap is reached.
	///
	/// Running out of memory is not fatal, the span then takes more passes.
	pub fn extend_for(&mut self, span: u64) {
		let wanted = span.div_ceil(self.window_bits).min(self.max_windows as u64) as usize;

		while self.windows.len() < wanted {
			match Self::try_window(self.window_bits) {
				Ok(window) => self.windows.push(window),
				Err(_) => {
					debug!(
						"<balloon> Could only allocate {} of {wanted} bitmap windows",
						self.windows.len()
					);
					break;
				}
			}
		}
	}

	/// Frees every window but the first.
	pub fn release_extended(&mut self) {
		self.windows.truncate(1);
	}

	pub fn clear(&mut self) {
		for window in &mut self.windows {
			window.fill(false);
		}
	}

	/// Marks the PFN at `offset` from the pass start.
	pub fn set(&mut self, offset: u64) {
		let index = (offset / self.window_bits) as usize;
		let bit = (offset % self.window_bits) as usize;
		self.windows[index].set(bit, true);
	}

	pub fn windows(&self) -> impl Iterator<Item = &BitSlice<u64, Lsb0>> {
		self.windows.iter().map(|window| window.as_bitslice())
	}
}

/// Calls `emit(start, len)` for every run of set bits in `window`.
pub(crate) fn for_each_run<E>(
	window: &BitSlice<u64, Lsb0>,
	mut emit: impl FnMut(u64, u64) -> Result<(), E>,
) -> Result<(), E> {
	let mut pos = 0;

	while let Some(one) = window[pos..].first_one() {
		let start = pos + one;
		let len = window[start..]
			.first_zero()
			.unwrap_or(window.len() - start);
		emit(start as u64, len as u64)?;
		pos = start + len;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use alloc::vec;
	use core::convert::Infallible;

	use super::*;

	fn runs(window: &BitSlice<u64, Lsb0>) -> Vec<(u64, u64)> {
		let mut runs = Vec::new();
		for_each_run::<Infallible>(window, |start, len| {
			runs.push((start, len));
			Ok(())
		})
		.unwrap();
		runs
	}

	#[test]
	fn extends_up_to_cap() {
		let mut pool = BitmapPool::try_new(8, 3).unwrap();
		assert_eq!(pool.window_bits(), 64);
		assert_eq!(pool.len(), 1);

		pool.extend_for(65);
		assert_eq!(pool.len(), 2);
		assert_eq!(pool.pass_bits(), 128);

		pool.extend_for(10_000);
		assert_eq!(pool.len(), 3);

		pool.release_extended();
		assert_eq!(pool.len(), 1);
	}

	#[test]
	fn oversized_pools_fail_to_allocate() {
		assert!(BitmapPool::try_new(8, usize::MAX).is_err());
		assert!(BitmapPool::try_new(usize::MAX & !7, 1).is_err());
	}

	#[test]
	fn set_spans_windows() {
		let mut pool = BitmapPool::try_new(8, 2).unwrap();
		pool.extend_for(128);
		pool.set(63);
		pool.set(64);

		let windows: Vec<_> = pool.windows().collect();
		assert_eq!(runs(windows[0]), [(63, 1)]);
		assert_eq!(runs(windows[1]), [(0, 1)]);

		pool.clear();
		assert!(pool.windows().all(|window| window.not_any()));
	}

	#[test]
	fn finds_runs() {
		let mut window = bitvec![u64, Lsb0; 0; 64];
		assert!(runs(&window).is_empty());

		window[3..7].fill(true);
		window.set(9, true);
		window[60..].fill(true);
		assert_eq!(runs(&window), vec![(3, 4), (9, 1), (60, 4)]);

		window.fill(true);
		assert_eq!(runs(&window), [(0, 64)]);
	}
}
