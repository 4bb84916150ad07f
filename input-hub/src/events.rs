use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DeviceId, geometry::Point};

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
	pub struct PointerButtons: u32 {
		const PRIMARY = 1 << 0;
		const SECONDARY = 1 << 1;
		const TERTIARY = 1 << 2;
		const BACK = 1 << 3;
		const FORWARD = 1 << 4;
		const SIDE = 1 << 5;
		const EXTRA = 1 << 6;
		const TASK = 1 << 7;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAction {
	Down,
	Up,
	Repeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointerAction {
	ButtonDown,
	ButtonUp,
	Motion,
	Enter,
	Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TouchAction {
	Down,
	Up,
	Change,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEvent {
	pub device_id: DeviceId,
	pub time: Duration,
	pub action: KeyAction,
	pub scan_code: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerEvent {
	pub device_id: DeviceId,
	pub time: Duration,
	pub action: PointerAction,
	/// Buttons held after this event. The seat replaces this with the
	/// aggregate over every pointing device before forwarding.
	pub buttons: PointerButtons,
	/// Absolute position, for devices that report one. Once the seat has
	/// processed the event this is the confined cursor position.
	pub position: Option<Point>,
	pub motion: Point,
	pub scroll: Point,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchContact {
	pub id: i32,
	pub action: TouchAction,
	pub position: Point,
	pub pressure: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchEvent {
	pub device_id: DeviceId,
	pub time: Duration,
	pub contacts: Vec<TouchContact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputEvent {
	Key(KeyEvent),
	Pointer(PointerEvent),
	Touch(TouchEvent),
}

impl InputEvent {
	pub fn device_id(&self) -> DeviceId {
		match self {
			InputEvent::Key(event) => event.device_id,
			InputEvent::Pointer(event) => event.device_id,
			InputEvent::Touch(event) => event.device_id,
		}
	}

	pub fn time(&self) -> Duration {
		match self {
			InputEvent::Key(event) => event.time,
			InputEvent::Pointer(event) => event.time,
			InputEvent::Touch(event) => event.time,
		}
	}
}

/// Builds events stamped with the id of the device it was handed to.
#[derive(Debug, Clone, Copy)]
pub struct EventBuilder {
	device_id: DeviceId,
}

impl EventBuilder {
	pub fn new(device_id: DeviceId) -> Self {
		Self { device_id }
	}

	pub fn device_id(&self) -> DeviceId {
		self.device_id
	}

	pub fn key_event(&self, time: Duration, action: KeyAction, scan_code: u32) -> InputEvent {
		InputEvent::Key(KeyEvent {
			device_id: self.device_id,
			time,
			action,
			scan_code,
		})
	}

	/// Relative pointer event, as produced by mice and touchpads.
	pub fn pointer_event(
		&self,
		time: Duration,
		action: PointerAction,
		buttons: PointerButtons,
		motion: Point,
		scroll: Point,
	) -> InputEvent {
		InputEvent::Pointer(PointerEvent {
			device_id: self.device_id,
			time,
			action,
			buttons,
			position: None,
			motion,
			scroll,
		})
	}

	/// Absolute pointer event, as produced by tablets and nested hosts.
	pub fn pointer_position_event(
		&self,
		time: Duration,
		action: PointerAction,
		buttons: PointerButtons,
		position: Point,
	) -> InputEvent {
		InputEvent::Pointer(PointerEvent {
			device_id: self.device_id,
			time,
			action,
			buttons,
			position: Some(position),
			motion: Point::default(),
			scroll: Point::default(),
		})
	}

	pub fn touch_event(&self, time: Duration, contacts: Vec<TouchContact>) -> InputEvent {
		InputEvent::Touch(TouchEvent {
			device_id: self.device_id,
			time,
			contacts,
		})
	}
}
