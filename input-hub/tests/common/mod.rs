#![allow(dead_code)]

use std::sync::{
	Arc, Mutex, Weak,
	atomic::{AtomicUsize, Ordering},
};

use shift_dispatch::MultiplexingDispatchable;
use shift_input::{
	DeviceCapabilities, DeviceHandle, DeviceHub, DeviceId, HubConfig, HubError, InputDevice,
	InputDeviceObserver, InputDispatcher, InputEvent, SeatTracker, ServerStatusListener,
	VirtualDevice, geometry::Rectangle,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
	Added(DeviceId),
	Changed(DeviceId),
	Removed(DeviceId),
	Complete,
}

/// Records every callback in order.
#[derive(Default)]
pub struct RecordingObserver {
	seen: Mutex<Vec<Seen>>,
}

impl RecordingObserver {
	pub fn take(&self) -> Vec<Seen> {
		std::mem::take(&mut *self.seen.lock().unwrap())
	}

	pub fn len(&self) -> usize {
		self.seen.lock().unwrap().len()
	}

	fn push(&self, seen: Seen) {
		self.seen.lock().unwrap().push(seen);
	}
}

impl InputDeviceObserver for RecordingObserver {
	fn device_added(&self, device: &DeviceHandle) {
		self.push(Seen::Added(device.id()));
	}
	fn device_changed(&self, device: &DeviceHandle) {
		self.push(Seen::Changed(device.id()));
	}
	fn device_removed(&self, device: &DeviceHandle) {
		self.push(Seen::Removed(device.id()));
	}
	fn changes_complete(&self) {
		self.push(Seen::Complete);
	}
}

/// Unregisters itself from the hub on its first `device_added`.
pub struct SelfRemovingObserver {
	pub hub: Weak<DeviceHub>,
	pub me: Mutex<Weak<SelfRemovingObserver>>,
	pub record: RecordingObserver,
	pub removal: Mutex<Option<Result<(), String>>>,
}

impl SelfRemovingObserver {
	pub fn new(hub: &Arc<DeviceHub>) -> Arc<Self> {
		let observer = Arc::new(Self {
			hub: Arc::downgrade(hub),
			me: Mutex::new(Weak::new()),
			record: RecordingObserver::default(),
			removal: Mutex::new(None),
		});
		*observer.me.lock().unwrap() = Arc::downgrade(&observer);
		observer
	}
}

impl InputDeviceObserver for SelfRemovingObserver {
	fn device_added(&self, device: &DeviceHandle) {
		self.record.device_added(device);
		let me = self.me.lock().unwrap().upgrade();
		if let (Some(hub), Some(me)) = (self.hub.upgrade(), me) {
			let me: Arc<dyn InputDeviceObserver> = me;
			let outcome = hub
				.remove_observer(&me)
				.map_err(|error: HubError| error.to_string());
			self.removal.lock().unwrap().get_or_insert(outcome);
		}
	}
	fn device_changed(&self, device: &DeviceHandle) {
		self.record.device_changed(device);
	}
	fn device_removed(&self, device: &DeviceHandle) {
		self.record.device_removed(device);
	}
	fn changes_complete(&self) {
		self.record.changes_complete();
	}
}

#[derive(Default)]
pub struct CountingStatus {
	pub ready: AtomicUsize,
	pub stopped: AtomicUsize,
}

impl CountingStatus {
	pub fn counts(&self) -> (usize, usize) {
		(
			self.ready.load(Ordering::SeqCst),
			self.stopped.load(Ordering::SeqCst),
		)
	}
}

impl ServerStatusListener for CountingStatus {
	fn ready_for_user_input(&self) {
		self.ready.fetch_add(1, Ordering::SeqCst);
	}
	fn stop_receiving_input(&self) {
		self.stopped.fetch_add(1, Ordering::SeqCst);
	}
}

#[derive(Default)]
pub struct RecordingDispatcher {
	pub events: Mutex<Vec<InputEvent>>,
}

impl InputDispatcher for RecordingDispatcher {
	fn dispatch(&self, event: &InputEvent) {
		self.events.lock().unwrap().push(event.clone());
	}
}

/// A hub on a reactor that only runs when the test calls `pump`.
pub struct Rig {
	pub reactor: Arc<MultiplexingDispatchable>,
	pub seat: Arc<SeatTracker>,
	pub forwarded: Arc<RecordingDispatcher>,
	pub status: Arc<CountingStatus>,
	pub hub: Arc<DeviceHub>,
}

impl Rig {
	pub fn new() -> Self {
		Self::with_config(HubConfig::default())
	}

	pub fn with_config(config: HubConfig) -> Self {
		let reactor = Arc::new(MultiplexingDispatchable::new().unwrap());
		let forwarded = Arc::new(RecordingDispatcher::default());
		let seat = Arc::new(SeatTracker::new(forwarded.clone()));
		seat.update_outputs(vec![Rectangle::new(0, 0, 1920, 1080)]);
		let status = Arc::new(CountingStatus::default());
		let hub = Arc::new(
			DeviceHub::new(reactor.clone(), seat.clone(), status.clone(), config).unwrap(),
		);
		Self {
			reactor,
			seat,
			forwarded,
			status,
			hub,
		}
	}

	pub fn pump(&self) -> usize {
		self.reactor.dispatch_pending()
	}

	pub fn observe(&self) -> Arc<RecordingObserver> {
		let observer = Arc::new(RecordingObserver::default());
		let registered: Arc<dyn InputDeviceObserver> = observer.clone();
		self.hub.add_observer(&registered).unwrap();
		self.pump();
		assert_eq!(observer.take(), vec![Seen::Complete]);
		observer
	}

	pub fn add(&self, device: &Arc<VirtualDevice>) -> DeviceHandle {
		self.hub.add_device(backend(device)).unwrap()
	}

	pub fn remove(&self, device: &Arc<VirtualDevice>) {
		self.hub.remove_device(&backend(device)).unwrap();
	}
}

pub fn backend(device: &Arc<VirtualDevice>) -> Arc<dyn InputDevice> {
	device.clone()
}

pub fn mouse(unique_id: &str) -> Arc<VirtualDevice> {
	Arc::new(VirtualDevice::new(
		format!("mouse {unique_id}"),
		unique_id,
		DeviceCapabilities::POINTER,
	))
}

pub fn keyboard(unique_id: &str) -> Arc<VirtualDevice> {
	Arc::new(VirtualDevice::new(
		format!("keyboard {unique_id}"),
		unique_id,
		DeviceCapabilities::KEYBOARD | DeviceCapabilities::ALPHA_NUMERIC,
	))
}

pub fn laptop_touchpad(unique_id: &str) -> Arc<VirtualDevice> {
	Arc::new(VirtualDevice::new(
		format!("touchpad {unique_id}"),
		unique_id,
		DeviceCapabilities::POINTER | DeviceCapabilities::TOUCHPAD | DeviceCapabilities::KEYBOARD,
	))
}
