//! Per-capability configuration blocks and the records the hub keeps for them.
//!
//! Every block validates itself before it is queued for a device, so a
//! malformed value is reported to the caller directly and never reaches a
//! backend.

use serde::{Deserialize, Serialize};

use crate::{DeviceCapabilities, DeviceError, DeviceId, DeviceInfo, InputDevice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PointerHandedness {
	#[default]
	Right,
	Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PointerAcceleration {
	None,
	#[default]
	Adaptive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerConfig {
	pub handedness: PointerHandedness,
	pub acceleration: PointerAcceleration,
	/// Acceleration speed in `[-1.0, 1.0]`.
	pub cursor_acceleration_bias: f64,
	/// Negative values give natural scrolling.
	pub horizontal_scroll_scale: f64,
	pub vertical_scroll_scale: f64,
}

impl Default for PointerConfig {
	fn default() -> Self {
		Self {
			handedness: PointerHandedness::Right,
			acceleration: PointerAcceleration::Adaptive,
			cursor_acceleration_bias: 0.0,
			horizontal_scroll_scale: 1.0,
			vertical_scroll_scale: 1.0,
		}
	}
}

impl PointerConfig {
	pub fn validate(&self) -> Result<(), DeviceError> {
		let bias = self.cursor_acceleration_bias;
		if !(-1.0..=1.0).contains(&bias) {
			return Err(DeviceError::OutOfRange {
				setting: "cursor_acceleration_bias",
				value: bias,
			});
		}
		for (setting, value) in [
			("horizontal_scroll_scale", self.horizontal_scroll_scale),
			("vertical_scroll_scale", self.vertical_scroll_scale),
		] {
			if !value.is_finite() {
				return Err(DeviceError::OutOfRange { setting, value });
			}
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TouchpadClickMode {
	None,
	#[default]
	AreaToClick,
	FingerCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TouchpadScrollMode {
	None,
	#[default]
	TwoFingerScroll,
	EdgeScroll,
	ButtonDownScroll,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TouchpadConfig {
	pub click_mode: TouchpadClickMode,
	pub scroll_mode: TouchpadScrollMode,
	/// Evdev button code used while `scroll_mode` is `ButtonDownScroll`.
	pub scroll_button: Option<u32>,
	pub tap_to_click: bool,
	pub disable_while_typing: bool,
	pub disable_with_external_mouse: bool,
	pub middle_mouse_button_emulation: bool,
}

impl Default for TouchpadConfig {
	fn default() -> Self {
		Self {
			click_mode: TouchpadClickMode::AreaToClick,
			scroll_mode: TouchpadScrollMode::TwoFingerScroll,
			scroll_button: None,
			tap_to_click: true,
			disable_while_typing: false,
			disable_with_external_mouse: false,
			middle_mouse_button_emulation: true,
		}
	}
}

impl TouchpadConfig {
	pub fn validate(&self) -> Result<(), DeviceError> {
		if self.scroll_mode == TouchpadScrollMode::ButtonDownScroll && self.scroll_button.is_none() {
			return Err(DeviceError::OutOfRange {
				setting: "scroll_button",
				value: 0.0,
			});
		}
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keymap {
	pub model: String,
	pub layout: String,
	pub variant: String,
	pub options: String,
}

impl Default for Keymap {
	fn default() -> Self {
		Self {
			model: "pc105+inet".into(),
			layout: "us".into(),
			variant: String::new(),
			options: String::new(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardConfig {
	pub keymap: Keymap,
	pub repeat_enabled: bool,
	/// Repeats per second.
	pub repeat_rate: u32,
	/// Milliseconds before the first repeat.
	pub repeat_delay: u32,
}

impl Default for KeyboardConfig {
	fn default() -> Self {
		Self {
			keymap: Keymap::default(),
			repeat_enabled: true,
			repeat_rate: 25,
			repeat_delay: 600,
		}
	}
}

impl KeyboardConfig {
	pub fn validate(&self) -> Result<(), DeviceError> {
		if self.repeat_enabled && self.repeat_rate == 0 {
			return Err(DeviceError::OutOfRange {
				setting: "repeat_rate",
				value: 0.0,
			});
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TouchscreenMappingMode {
	/// Map onto the output named by `output_id`.
	#[default]
	ToOutput,
	/// Map onto the bounding box of every output.
	ToDisplayWall,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TouchscreenConfig {
	pub output_id: Option<u32>,
	pub mapping_mode: TouchscreenMappingMode,
}

impl TouchscreenConfig {
	pub fn validate(&self) -> Result<(), DeviceError> {
		Ok(())
	}
}

/// What the hub remembers about a device, including after it disappears.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
	pub id: DeviceId,
	pub info: DeviceInfo,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pointer: Option<PointerConfig>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub touchpad: Option<TouchpadConfig>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub keyboard: Option<KeyboardConfig>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub touchscreen: Option<TouchscreenConfig>,
}

impl DeviceConfig {
	/// Initial configuration for a freshly seen device: whatever the backend
	/// reports, falling back to defaults, for each advertised capability.
	pub fn from_backend(id: DeviceId, info: DeviceInfo, device: &dyn InputDevice) -> Self {
		let caps = info.capabilities;
		Self {
			id,
			pointer: caps
				.contains(DeviceCapabilities::POINTER)
				.then(|| device.pointer_settings().unwrap_or_default()),
			touchpad: caps
				.contains(DeviceCapabilities::TOUCHPAD)
				.then(|| device.touchpad_settings().unwrap_or_default()),
			keyboard: caps
				.contains(DeviceCapabilities::KEYBOARD)
				.then(|| device.keyboard_settings().unwrap_or_default()),
			touchscreen: caps
				.contains(DeviceCapabilities::TOUCHSCREEN)
				.then(|| device.touchscreen_settings().unwrap_or_default()),
			info,
		}
	}

	/// Adopts a stored record for a device reappearing as `fresh`.
	///
	/// Keeps the stored id and blocks. Blocks for capabilities the device no
	/// longer advertises are dropped and newly advertised ones come from `fresh`.
	pub fn restore(mut self, fresh: DeviceConfig) -> Self {
		let caps = fresh.info.capabilities;
		self.pointer = caps
			.contains(DeviceCapabilities::POINTER)
			.then(|| self.pointer.take().or(fresh.pointer))
			.flatten();
		self.touchpad = caps
			.contains(DeviceCapabilities::TOUCHPAD)
			.then(|| self.touchpad.take().or(fresh.touchpad))
			.flatten();
		self.keyboard = caps
			.contains(DeviceCapabilities::KEYBOARD)
			.then(|| self.keyboard.take().or(fresh.keyboard))
			.flatten();
		self.touchscreen = caps
			.contains(DeviceCapabilities::TOUCHSCREEN)
			.then(|| self.touchscreen.take().or(fresh.touchscreen))
			.flatten();
		self.info = fresh.info;
		self
	}

	/// Pushes every block to `device`, stopping at the first rejection.
	pub(crate) fn apply_to(&self, device: &dyn InputDevice) -> Result<(), DeviceError> {
		if let Some(pointer) = &self.pointer {
			device.apply_pointer_settings(pointer)?;
		}
		if let Some(touchpad) = &self.touchpad {
			device.apply_touchpad_settings(touchpad)?;
		}
		if let Some(keyboard) = &self.keyboard {
			device.apply_keyboard_settings(keyboard)?;
		}
		if let Some(touchscreen) = &self.touchscreen {
			device.apply_touchscreen_settings(touchscreen)?;
		}
		Ok(())
	}
}

/// A configuration block that can be queued for a device.
pub(crate) trait ConfigBlock: Clone + Send + 'static {
	const CAPABILITY: DeviceCapabilities;

	fn validate(&self) -> Result<(), DeviceError>;
	fn apply_to(&self, device: &dyn InputDevice) -> Result<(), DeviceError>;
	fn store(self, config: &mut DeviceConfig);
}

macro_rules! config_block {
	($block:ty, $capability:ident, $field:ident, $apply:ident) => {
		impl ConfigBlock for $block {
			const CAPABILITY: DeviceCapabilities = DeviceCapabilities::$capability;

			fn validate(&self) -> Result<(), DeviceError> {
				<$block>::validate(self)
			}

			fn apply_to(&self, device: &dyn InputDevice) -> Result<(), DeviceError> {
				device.$apply(self)
			}

			fn store(self, config: &mut DeviceConfig) {
				config.$field = Some(self);
			}
		}
	};
}

config_block!(PointerConfig, POINTER, pointer, apply_pointer_settings);
config_block!(TouchpadConfig, TOUCHPAD, touchpad, apply_touchpad_settings);
config_block!(KeyboardConfig, KEYBOARD, keyboard, apply_keyboard_settings);
config_block!(TouchscreenConfig, TOUCHSCREEN, touchscreen, apply_touchscreen_settings);

/// Construction-time settings for a [`crate::DeviceHub`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
	/// Id handed to the first device that has no stored configuration.
	pub first_device_id: u64,
	/// Configuration to restore when a device with a matching unique id appears.
	pub stored_devices: Vec<DeviceConfig>,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			first_device_id: 1,
			stored_devices: Vec::new(),
		}
	}
}

impl HubConfig {
	/// Reads `SHIFT_INPUT_FIRST_DEVICE_ID`; anything unset or invalid keeps its default.
	pub fn from_env() -> Self {
		let mut config = Self::default();
		if let Some(first) = std::env::var("SHIFT_INPUT_FIRST_DEVICE_ID")
			.ok()
			.map(|v| v.trim().to_string())
			.filter(|v| !v.is_empty())
		{
			match first.parse::<u64>() {
				Ok(id) => config.first_device_id = id,
				Err(e) => tracing::warn!(value = %first, "invalid SHIFT_INPUT_FIRST_DEVICE_ID: {e}"),
			}
		}
		config
	}

	/// The next id to hand out: past `first_device_id` and every stored id.
	pub(crate) fn seed_id(&self) -> u64 {
		self
			.stored_devices
			.iter()
			.map(|stored| stored.id.raw().saturating_add(1))
			.fold(self.first_device_id, u64::max)
	}
}
