use std::{
	collections::HashMap,
	sync::{Arc, Mutex, PoisonError},
};

use crate::{
	DeviceId,
	events::{InputEvent, KeyAction, KeyEvent, PointerButtons, PointerEvent},
	geometry::{self, Point, Rectangle},
};

/// Aggregates state across every device feeding one logical seat.
pub trait Seat: Send + Sync {
	fn add_device(&self, id: DeviceId);
	fn remove_device(&self, id: DeviceId);
	fn dispatch_event(&self, event: InputEvent);
	fn bounding_rectangle(&self) -> Rectangle;
	fn confine_pointer(&self, point: Point) -> Point;
	fn set_key_state(&self, id: DeviceId, scan_codes: &[u32]);
	fn set_pointer_state(&self, id: DeviceId, buttons: PointerButtons);
	fn set_cursor_position(&self, position: Point);
	fn set_confinement_regions(&self, regions: Vec<Rectangle>);
	fn reset_confinement_regions(&self);
}

/// Next stage after the seat, e.g. focus routing.
pub trait InputDispatcher: Send + Sync {
	fn dispatch(&self, event: &InputEvent);
}

#[derive(Debug, Default, Clone, PartialEq)]
struct DeviceData {
	scan_codes: Vec<u32>,
	buttons: PointerButtons,
}

impl DeviceData {
	/// Drops key transitions that contradict what the device already reported.
	fn allows(&self, event: &KeyEvent) -> bool {
		let pressed = self.scan_codes.contains(&event.scan_code);
		match event.action {
			KeyAction::Down => !pressed,
			KeyAction::Up | KeyAction::Repeat => pressed,
		}
	}

	fn update_scan_codes(&mut self, event: &KeyEvent) {
		match event.action {
			KeyAction::Down => self.scan_codes.push(event.scan_code),
			KeyAction::Up => self.scan_codes.retain(|code| *code != event.scan_code),
			KeyAction::Repeat => {}
		}
	}
}

#[derive(Default)]
struct SeatState {
	devices: HashMap<DeviceId, DeviceData>,
	buttons: PointerButtons,
	cursor: Point,
}

impl SeatState {
	fn update_buttons(&mut self) {
		self.buttons = self
			.devices
			.values()
			.fold(PointerButtons::empty(), |acc, data| acc | data.buttons);
	}
}

#[derive(Default)]
struct Regions {
	outputs: Vec<Rectangle>,
	confinement: Vec<Rectangle>,
}

/// Per-device snapshot returned by [`SeatTracker::device_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
	pub id: DeviceId,
	pub pressed_keys: Vec<u32>,
	pub buttons: PointerButtons,
}

/// Reference [`Seat`]: tracks pressed keys and buttons per device, keeps the
/// cursor inside the outputs and any confinement region, and forwards every
/// accepted event to an [`InputDispatcher`].
pub struct SeatTracker {
	dispatcher: Arc<dyn InputDispatcher>,
	state: Mutex<SeatState>,
	regions: Mutex<Regions>,
}

impl SeatTracker {
	pub fn new(dispatcher: Arc<dyn InputDispatcher>) -> Self {
		Self {
			dispatcher,
			state: Mutex::new(SeatState::default()),
			regions: Mutex::new(Regions::default()),
		}
	}

	/// Buttons held on any pointing device.
	pub fn button_state(&self) -> PointerButtons {
		self.state().buttons
	}

	pub fn cursor_position(&self) -> Point {
		self.state().cursor
	}

	pub fn update_outputs(&self, outputs: Vec<Rectangle>) {
		self.regions().outputs = outputs;
	}

	pub fn device_state(&self) -> Vec<DeviceState> {
		let state = self.state();
		let mut devices = state
			.devices
			.iter()
			.map(|(id, data)| DeviceState {
				id: *id,
				pressed_keys: data.scan_codes.clone(),
				buttons: data.buttons,
			})
			.collect::<Vec<_>>();
		devices.sort_by_key(|device| device.id);
		devices
	}

	fn state(&self) -> std::sync::MutexGuard<'_, SeatState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn regions(&self) -> std::sync::MutexGuard<'_, Regions> {
		self.regions.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn confine(&self, point: Point) -> Point {
		let regions = self.regions();
		let point = geometry::confine(&regions.outputs, point);
		geometry::confine(&regions.confinement, point)
	}

	fn update_pointer(&self, state: &mut SeatState, event: &mut PointerEvent) -> bool {
		let Some(data) = state.devices.get_mut(&event.device_id) else {
			return false;
		};
		let buttons_changed = data.buttons != event.buttons;
		data.buttons = event.buttons;
		if buttons_changed {
			state.update_buttons();
		}

		let target = match event.position {
			Some(position) => position,
			None => Point::new(
				state.cursor.x + event.motion.x,
				state.cursor.y + event.motion.y,
			),
		};
		state.cursor = self.confine(target);
		event.position = Some(state.cursor);
		event.buttons = state.buttons;
		true
	}
}

impl Seat for SeatTracker {
	fn add_device(&self, id: DeviceId) {
		self.state().devices.entry(id).or_default();
		tracing::debug!(device = %id, "seat gained device");
	}

	fn remove_device(&self, id: DeviceId) {
		let mut state = self.state();
		match state.devices.remove(&id) {
			Some(data) => {
				if !data.buttons.is_empty() {
					state.update_buttons();
				}
				tracing::debug!(device = %id, "seat lost device");
			}
			None => tracing::warn!(device = %id, "removing unknown device from seat"),
		}
	}

	fn dispatch_event(&self, mut event: InputEvent) {
		{
			let mut state = self.state();
			let accepted = match &mut event {
				InputEvent::Key(key) => match state.devices.get_mut(&key.device_id) {
					Some(data) if data.allows(key) => {
						data.update_scan_codes(key);
						true
					}
					Some(_) => false,
					None => false,
				},
				InputEvent::Pointer(pointer) => self.update_pointer(&mut state, pointer),
				InputEvent::Touch(touch) => state.devices.contains_key(&touch.device_id),
			};
			if !accepted {
				tracing::trace!(device = %event.device_id(), "seat filtered event");
				return;
			}
		}
		self.dispatcher.dispatch(&event);
	}

	fn bounding_rectangle(&self) -> Rectangle {
		Rectangle::bounding(&self.regions().outputs)
	}

	fn confine_pointer(&self, point: Point) -> Point {
		self.confine(point)
	}

	fn set_key_state(&self, id: DeviceId, scan_codes: &[u32]) {
		if let Some(data) = self.state().devices.get_mut(&id) {
			data.scan_codes = scan_codes.to_vec();
		}
	}

	fn set_pointer_state(&self, id: DeviceId, buttons: PointerButtons) {
		let mut state = self.state();
		if let Some(data) = state.devices.get_mut(&id) {
			data.buttons = buttons;
			state.update_buttons();
		}
	}

	fn set_cursor_position(&self, position: Point) {
		self.state().cursor = position;
	}

	fn set_confinement_regions(&self, regions: Vec<Rectangle>) {
		self.regions().confinement = regions;
	}

	fn reset_confinement_regions(&self) {
		self.regions().confinement.clear();
	}
}
