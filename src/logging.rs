// Copyright (c) 2017-2019 Stefan Lankes, RWTH Aachen University
//               2017 Colin Finck, RWTH Aachen University
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use hermit_sync::OnceCell;
use log::{LevelFilter, Metadata, Record, SetLoggerError, set_logger, set_max_level};

/// Output routine of the embedding kernel, usually its serial console.
pub type LogSink = fn(fmt::Arguments<'_>);

/// Data structure to filter balloon messages
struct BalloonLogger {
	sink: OnceCell<LogSink>,
}

static LOGGER: BalloonLogger = BalloonLogger {
	sink: OnceCell::new(),
};

impl log::Log for BalloonLogger {
	fn enabled(&self, _: &Metadata<'_>) -> bool {
		true
	}

	fn flush(&self) {
		// nothing to do
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}

		if let Some(sink) = self.sink.get() {
			sink(format_args!(
				"[{}][{}] {}",
				record.target(),
				record.level(),
				record.args()
			));
		}
	}
}

/// Installs the balloon logger, writing every record through `sink`.
///
/// Fails if another logger has already been registered with [`log`].
pub fn init(sink: LogSink) -> Result<(), SetLoggerError> {
	set_logger(&LOGGER)?;
	// set_logger succeeds once, so the cell is still empty here
	let _ = LOGGER.sink.set(sink);
	set_max_level(max_level());
	Ok(())
}

// Determines LevelFilter at compile time
fn max_level() -> LevelFilter {
	let log_level: Option<&'static str> = option_env!("BALLOON_LOG_LEVEL_FILTER");
	match log_level {
		Some("Error") => LevelFilter::Error,
		Some("Debug") => LevelFilter::Debug,
		Some("Off") => LevelFilter::Off,
		Some("Trace") => LevelFilter::Trace,
		Some("Warn") => LevelFilter::Warn,
		_ => LevelFilter::Info,
	}
}

macro_rules! infoheader {
	($str:expr) => {{
		info!("");
		info!("{:=^70}", $str);
	}};
}

macro_rules! infoentry {
	($str:expr, $rhs:expr) => (infoentry!($str, "{}", $rhs));
	($str:expr, $($arg:tt)+) => (info!("{:25}{}", concat!($str, ":"), format_args!($($arg)+)));
}

macro_rules! infofooter {
	() => {{
		info!("{:=^70}", '=');
		info!("");
	}};
}
