use std::sync::{Arc, Mutex, PoisonError};

use crate::{
	DeviceHandle, DeviceId, InputSink, Seat,
	events::{InputEvent, PointerButtons},
	geometry::{Point, Rectangle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
	Starting,
	Started,
	Stopping,
}

/// The hub's bookkeeping for one backend device.
pub(crate) struct RegisteredDevice {
	pub(crate) handle: DeviceHandle,
	pub(crate) sink: Arc<DeviceSink>,
	pub(crate) state: Lifecycle,
}

impl RegisteredDevice {
	pub(crate) fn new(handle: DeviceHandle, sink: Arc<DeviceSink>) -> Self {
		Self {
			handle,
			sink,
			state: Lifecycle::Starting,
		}
	}

	pub(crate) fn is_live(&self) -> bool {
		self.state == Lifecycle::Started
	}
}

/// Routes a device's events straight to the seat, bypassing every queue.
///
/// Detached from the seat when the device stops; later events are dropped.
pub(crate) struct DeviceSink {
	id: DeviceId,
	seat: Mutex<Option<Arc<dyn Seat>>>,
}

impl DeviceSink {
	pub(crate) fn new(id: DeviceId) -> Self {
		Self {
			id,
			seat: Mutex::new(None),
		}
	}

	pub(crate) fn attach(&self, seat: Arc<dyn Seat>) {
		*self.seat.lock().unwrap_or_else(PoisonError::into_inner) = Some(seat);
	}

	pub(crate) fn detach(&self) {
		self.seat.lock().unwrap_or_else(PoisonError::into_inner).take();
	}

	fn seat(&self) -> Option<Arc<dyn Seat>> {
		self.seat.lock().unwrap_or_else(PoisonError::into_inner).clone()
	}
}

impl InputSink for DeviceSink {
	fn handle_input(&self, event: InputEvent) {
		if event.device_id() != self.id {
			tracing::warn!(
				device = %self.id,
				claimed = %event.device_id(),
				"dropping event stamped with another device's id"
			);
			return;
		}
		if let Some(seat) = self.seat() {
			seat.dispatch_event(event);
		}
	}

	fn bounding_rectangle(&self) -> Rectangle {
		self
			.seat()
			.map(|seat| seat.bounding_rectangle())
			.unwrap_or_default()
	}

	fn confine_pointer(&self, point: Point) -> Point {
		match self.seat() {
			Some(seat) => seat.confine_pointer(point),
			None => point,
		}
	}

	fn key_state(&self, scan_codes: &[u32]) {
		if let Some(seat) = self.seat() {
			seat.set_key_state(self.id, scan_codes);
		}
	}

	fn pointer_state(&self, buttons: PointerButtons) {
		if let Some(seat) = self.seat() {
			seat.set_pointer_state(self.id, buttons);
		}
	}
}
