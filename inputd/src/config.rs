use std::str::FromStr;

use shift_input::DeviceCapabilities;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualKind {
	Keyboard,
	Mouse,
	Touchpad,
}

impl VirtualKind {
	pub fn capabilities(self) -> DeviceCapabilities {
		match self {
			VirtualKind::Keyboard => DeviceCapabilities::KEYBOARD | DeviceCapabilities::ALPHA_NUMERIC,
			VirtualKind::Mouse => DeviceCapabilities::POINTER,
			VirtualKind::Touchpad => DeviceCapabilities::POINTER | DeviceCapabilities::TOUCHPAD,
		}
	}
}

#[derive(Error, Debug, PartialEq)]
#[error("unknown virtual device kind {0:?}")]
pub struct UnknownKind(String);

impl FromStr for VirtualKind {
	type Err = UnknownKind;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"keyboard" => Ok(VirtualKind::Keyboard),
			"mouse" => Ok(VirtualKind::Mouse),
			"touchpad" => Ok(VirtualKind::Touchpad),
			other => Err(UnknownKind(other.to_string())),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualSpec {
	pub kind: VirtualKind,
	pub unique_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
	/// Worker threads dispatching the reactor.
	pub threads: usize,
	pub pool_name: String,
	pub virtual_devices: Vec<VirtualSpec>,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self {
			threads: 2,
			pool_name: "shift-input".into(),
			virtual_devices: parse_devices("keyboard,mouse"),
		}
	}
}

fn env_value(name: &str) -> Option<String> {
	std::env::var(name)
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

/// `kind[:unique_id]` entries separated by commas; bad entries are skipped.
fn parse_devices(raw: &str) -> Vec<VirtualSpec> {
	raw.split(',')
		.map(str::trim)
		.filter(|entry| !entry.is_empty())
		.enumerate()
		.filter_map(|(index, entry)| {
			let (kind, unique_id) = match entry.split_once(':') {
				Some((kind, unique_id)) if !unique_id.trim().is_empty() => {
					(kind.trim(), unique_id.trim().to_string())
				}
				Some((kind, _)) => (kind.trim(), format!("virtual-{}-{index}", kind.trim())),
				None => (entry, format!("virtual-{entry}-{index}")),
			};
			match kind.parse::<VirtualKind>() {
				Ok(kind) => Some(VirtualSpec { kind, unique_id }),
				Err(e) => {
					tracing::warn!(value = %entry, "invalid SHIFT_INPUT_VIRTUAL_DEVICES entry: {e}");
					None
				}
			}
		})
		.collect()
}

impl DaemonConfig {
	/// Reads `SHIFT_INPUT_THREADS`, `SHIFT_INPUT_POOL_NAME` and
	/// `SHIFT_INPUT_VIRTUAL_DEVICES`, keeping defaults for anything unset or invalid.
	pub fn from_env() -> Self {
		let mut config = Self::default();
		if let Some(raw) = env_value("SHIFT_INPUT_THREADS") {
			match raw.parse::<usize>() {
				Ok(threads) if threads > 0 => config.threads = threads,
				Ok(_) => tracing::warn!(value = %raw, "SHIFT_INPUT_THREADS must be at least 1"),
				Err(e) => tracing::warn!(value = %raw, "invalid SHIFT_INPUT_THREADS: {e}"),
			}
		}
		if let Some(name) = env_value("SHIFT_INPUT_POOL_NAME") {
			config.pool_name = name;
		}
		if let Some(raw) = env_value("SHIFT_INPUT_VIRTUAL_DEVICES") {
			config.virtual_devices = match raw.as_str() {
				"none" => Vec::new(),
				_ => parse_devices(&raw),
			};
		}
		config
	}
}
