use std::{
	sync::{
		Arc, Mutex, MutexGuard, PoisonError,
		atomic::{AtomicBool, AtomicUsize, Ordering},
	},
	time::Instant,
};

use crate::{
	DeviceCapabilities, DeviceError, DeviceId, DeviceInfo, InputDevice, InputSink,
	config::{KeyboardConfig, PointerConfig, TouchpadConfig, TouchscreenConfig},
	events::{EventBuilder, InputEvent, KeyAction, PointerAction, PointerButtons},
	geometry::Point,
};

struct Connection {
	sink: Arc<dyn InputSink>,
	builder: EventBuilder,
}

#[derive(Default)]
struct Settings {
	pointer: Option<PointerConfig>,
	touchpad: Option<TouchpadConfig>,
	keyboard: Option<KeyboardConfig>,
	touchscreen: Option<TouchscreenConfig>,
}

/// Software input device with no hardware behind it.
///
/// Injected input only goes anywhere while the device is started. Settings
/// are kept in memory for each advertised capability.
pub struct VirtualDevice {
	info: DeviceInfo,
	epoch: Instant,
	connection: Mutex<Option<Connection>>,
	settings: Mutex<Settings>,
	buttons: Mutex<PointerButtons>,
	failing: AtomicBool,
	applied: AtomicUsize,
}

impl VirtualDevice {
	pub fn new(
		name: impl Into<String>,
		unique_id: impl Into<String>,
		capabilities: DeviceCapabilities,
	) -> Self {
		let settings = Settings {
			pointer: capabilities
				.contains(DeviceCapabilities::POINTER)
				.then(PointerConfig::default),
			touchpad: capabilities
				.contains(DeviceCapabilities::TOUCHPAD)
				.then(TouchpadConfig::default),
			keyboard: capabilities
				.contains(DeviceCapabilities::KEYBOARD)
				.then(KeyboardConfig::default),
			touchscreen: capabilities
				.contains(DeviceCapabilities::TOUCHSCREEN)
				.then(TouchscreenConfig::default),
		};
		Self {
			info: DeviceInfo {
				name: name.into(),
				unique_id: unique_id.into(),
				capabilities,
			},
			epoch: Instant::now(),
			connection: Mutex::new(None),
			settings: Mutex::new(settings),
			buttons: Mutex::new(PointerButtons::empty()),
			failing: AtomicBool::new(false),
			applied: AtomicUsize::new(0),
		}
	}

	pub fn is_started(&self) -> bool {
		self.connection().is_some()
	}

	/// Id the device was started with, if it is running.
	pub fn device_id(&self) -> Option<DeviceId> {
		self.connection()
			.as_ref()
			.map(|connection| connection.builder.device_id())
	}

	/// Makes every later settings change fail as a backend would.
	pub fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	/// Settings blocks accepted so far.
	pub fn applied_changes(&self) -> usize {
		self.applied.load(Ordering::SeqCst)
	}

	/// Returns whether the event was delivered.
	pub fn press_key(&self, scan_code: u32) -> bool {
		self.emit(|builder, time| builder.key_event(time, KeyAction::Down, scan_code))
	}

	pub fn release_key(&self, scan_code: u32) -> bool {
		self.emit(|builder, time| builder.key_event(time, KeyAction::Up, scan_code))
	}

	pub fn move_pointer(&self, dx: f32, dy: f32) -> bool {
		let buttons = *self.buttons();
		self.emit(|builder, time| {
			builder.pointer_event(
				time,
				PointerAction::Motion,
				buttons,
				Point::new(dx, dy),
				Point::default(),
			)
		})
	}

	pub fn press_button(&self, button: PointerButtons) -> bool {
		let buttons = {
			let mut held = self.buttons();
			held.insert(button);
			*held
		};
		self.emit(|builder, time| {
			builder.pointer_event(
				time,
				PointerAction::ButtonDown,
				buttons,
				Point::default(),
				Point::default(),
			)
		})
	}

	pub fn release_button(&self, button: PointerButtons) -> bool {
		let buttons = {
			let mut held = self.buttons();
			held.remove(button);
			*held
		};
		self.emit(|builder, time| {
			builder.pointer_event(
				time,
				PointerAction::ButtonUp,
				buttons,
				Point::default(),
				Point::default(),
			)
		})
	}

	fn emit(&self, build: impl FnOnce(&EventBuilder, std::time::Duration) -> InputEvent) -> bool {
		let (sink, event) = {
			let connection = self.connection();
			let Some(connection) = connection.as_ref() else {
				tracing::trace!(device = %self.info.name, "virtual device not started, dropping input");
				return false;
			};
			(
				Arc::clone(&connection.sink),
				build(&connection.builder, self.epoch.elapsed()),
			)
		};
		sink.handle_input(event);
		true
	}

	fn connection(&self) -> MutexGuard<'_, Option<Connection>> {
		self.connection.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn settings(&self) -> MutexGuard<'_, Settings> {
		self.settings.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn buttons(&self) -> MutexGuard<'_, PointerButtons> {
		self.buttons.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn accept<C: Clone>(
		&self,
		capability: DeviceCapabilities,
		settings: &C,
		slot: impl FnOnce(&mut Settings) -> &mut Option<C>,
	) -> Result<(), DeviceError> {
		if !self.info.capabilities.contains(capability) {
			return Err(DeviceError::Unsupported(capability));
		}
		if self.failing.load(Ordering::SeqCst) {
			return Err(DeviceError::Backend("injected failure".into()));
		}
		let mut all = self.settings();
		*slot(&mut *all) = Some(settings.clone());
		drop(all);
		self.applied.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

impl InputDevice for VirtualDevice {
	fn start(&self, sink: Arc<dyn InputSink>, builder: EventBuilder) {
		tracing::debug!(device = %builder.device_id(), name = %self.info.name, "virtual device started");
		*self.connection() = Some(Connection { sink, builder });
	}

	fn stop(&self) {
		if let Some(connection) = self.connection().take() {
			tracing::debug!(device = %connection.builder.device_id(), "virtual device stopped");
		}
		*self.buttons() = PointerButtons::empty();
	}

	fn device_info(&self) -> DeviceInfo {
		self.info.clone()
	}

	fn pointer_settings(&self) -> Option<PointerConfig> {
		self.settings().pointer.clone()
	}

	fn apply_pointer_settings(&self, settings: &PointerConfig) -> Result<(), DeviceError> {
		self.accept(DeviceCapabilities::POINTER, settings, |all| &mut all.pointer)
	}

	fn touchpad_settings(&self) -> Option<TouchpadConfig> {
		self.settings().touchpad.clone()
	}

	fn apply_touchpad_settings(&self, settings: &TouchpadConfig) -> Result<(), DeviceError> {
		self.accept(DeviceCapabilities::TOUCHPAD, settings, |all| &mut all.touchpad)
	}

	fn keyboard_settings(&self) -> Option<KeyboardConfig> {
		self.settings().keyboard.clone()
	}

	fn apply_keyboard_settings(&self, settings: &KeyboardConfig) -> Result<(), DeviceError> {
		self.accept(DeviceCapabilities::KEYBOARD, settings, |all| &mut all.keyboard)
	}

	fn touchscreen_settings(&self) -> Option<TouchscreenConfig> {
		self.settings().touchscreen.clone()
	}

	fn apply_touchscreen_settings(&self, settings: &TouchscreenConfig) -> Result<(), DeviceError> {
		self.accept(DeviceCapabilities::TOUCHSCREEN, settings, |all| {
			&mut all.touchscreen
		})
	}
}
