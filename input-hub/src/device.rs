use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
	DeviceError,
	config::{KeyboardConfig, PointerConfig, TouchpadConfig, TouchscreenConfig},
	events::{EventBuilder, InputEvent, PointerButtons},
	geometry::{Point, Rectangle},
};

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
	pub struct DeviceCapabilities: u32 {
		const POINTER = 1 << 1;
		const KEYBOARD = 1 << 2;
		const TOUCHPAD = 1 << 3;
		const TOUCHSCREEN = 1 << 4;
		const GAMEPAD = 1 << 5;
		const JOYSTICK = 1 << 6;
		const SWITCH = 1 << 7;
		const MULTITOUCH = 1 << 8;
		const ALPHA_NUMERIC = 1 << 9;
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
	pub name: String,
	/// Stable across reboots and replugs; keys stored configuration.
	pub unique_id: String,
	pub capabilities: DeviceCapabilities,
}

/// Where a started device delivers its events.
pub trait InputSink: Send + Sync {
	fn handle_input(&self, event: InputEvent);

	/// Bounding box of every output, for devices reporting absolute positions.
	fn bounding_rectangle(&self) -> Rectangle;

	/// Where the cursor would end up if moved to `point`.
	fn confine_pointer(&self, point: Point) -> Point;

	/// Scan codes the device reports as held, e.g. right after it appears.
	fn key_state(&self, scan_codes: &[u32]);

	fn pointer_state(&self, buttons: PointerButtons);
}

/// A physical or virtual input device as seen by a platform backend.
///
/// The `*_settings` getters return `None` and the `apply_*` methods fail with
/// [`DeviceError::Unsupported`] unless overridden for a capability the device
/// advertises.
pub trait InputDevice: Send + Sync {
	fn start(&self, sink: Arc<dyn InputSink>, builder: EventBuilder);
	fn stop(&self);
	fn device_info(&self) -> DeviceInfo;

	fn pointer_settings(&self) -> Option<PointerConfig> {
		None
	}
	fn apply_pointer_settings(&self, _settings: &PointerConfig) -> Result<(), DeviceError> {
		Err(DeviceError::Unsupported(DeviceCapabilities::POINTER))
	}

	fn touchpad_settings(&self) -> Option<TouchpadConfig> {
		None
	}
	fn apply_touchpad_settings(&self, _settings: &TouchpadConfig) -> Result<(), DeviceError> {
		Err(DeviceError::Unsupported(DeviceCapabilities::TOUCHPAD))
	}

	fn keyboard_settings(&self) -> Option<KeyboardConfig> {
		None
	}
	fn apply_keyboard_settings(&self, _settings: &KeyboardConfig) -> Result<(), DeviceError> {
		Err(DeviceError::Unsupported(DeviceCapabilities::KEYBOARD))
	}

	fn touchscreen_settings(&self) -> Option<TouchscreenConfig> {
		None
	}
	fn apply_touchscreen_settings(&self, _settings: &TouchscreenConfig) -> Result<(), DeviceError> {
		Err(DeviceError::Unsupported(DeviceCapabilities::TOUCHSCREEN))
	}
}
