mod common;

use std::{
	sync::{Arc, Mutex},
	thread,
	time::{Duration, Instant},
};

use common::{
	RecordingObserver, Rig, Seen, SelfRemovingObserver, backend, keyboard, laptop_touchpad, mouse,
};
use shift_dispatch::{Dispatchable, ThreadedDispatcher};
use shift_input::{
	DeviceCapabilities, DeviceConfig, DeviceError, DeviceHandle, DeviceHub, DeviceId, HubConfig,
	HubError, InputDevice, InputDeviceObserver, InputEvent, VirtualDevice, KeyboardConfig, PointerConfig, TouchpadConfig,
	config::{PointerHandedness, TouchpadScrollMode},
};

#[test]
fn devices_get_sequential_ids_and_observers_hear_about_them() {
	let rig = Rig::new();
	let observer = rig.observe();
	let (mouse, keyboard) = (mouse("usb-mouse"), keyboard("usb-kbd"));

	let first = rig.add(&mouse);
	let second = rig.add(&keyboard);
	assert_eq!(first.id(), DeviceId::from_raw(1));
	assert_eq!(second.id(), DeviceId::from_raw(2));
	assert_eq!(rig.hub.device_count(), 2);
	assert!(mouse.is_started());

	rig.pump();
	assert_eq!(
		observer.take(),
		vec![
			Seen::Added(first.id()),
			Seen::Complete,
			Seen::Added(second.id()),
			Seen::Complete,
		]
	);

	rig.remove(&mouse);
	rig.pump();
	assert!(!mouse.is_started());
	assert!(!first.is_attached());
	assert_eq!(rig.hub.devices(), vec![second]);
	assert_eq!(observer.take(), vec![Seen::Removed(first.id()), Seen::Complete]);
}

#[test]
fn adding_twice_and_removing_strangers_are_refused() {
	let rig = Rig::new();
	let mouse = mouse("usb-mouse");
	rig.add(&mouse);

	assert!(matches!(
		rig.hub.add_device(backend(&mouse)),
		Err(HubError::AlreadyManaged(_))
	));
	assert!(matches!(
		rig.hub.remove_device(&backend(&keyboard("usb-kbd"))),
		Err(HubError::NotManaged(_))
	));
	assert_eq!(rig.hub.device_count(), 1);
}

#[test]
fn status_listener_fires_on_first_and_last_device_only() {
	let rig = Rig::new();
	let (mouse, keyboard) = (mouse("usb-mouse"), keyboard("usb-kbd"));
	assert_eq!(rig.status.counts(), (0, 0));

	rig.add(&mouse);
	rig.add(&keyboard);
	assert_eq!(rig.status.counts(), (1, 0));

	rig.remove(&mouse);
	assert_eq!(rig.status.counts(), (1, 0));
	rig.remove(&keyboard);
	assert_eq!(rig.status.counts(), (1, 1));

	rig.add(&mouse);
	assert_eq!(rig.status.counts(), (2, 1));
}

#[test]
fn configuration_change_is_applied_on_the_device_queue() {
	let rig = Rig::new();
	let observer = rig.observe();
	let mouse = mouse("usb-mouse");
	let handle = rig.add(&mouse);
	rig.pump();
	observer.take();

	let left = PointerConfig {
		handedness: PointerHandedness::Left,
		..PointerConfig::default()
	};
	let pending = handle.apply_pointer_configuration(left.clone()).unwrap();
	assert_eq!(pending.try_outcome(), None);
	assert_eq!(handle.pointer_configuration(), Some(PointerConfig::default()));

	rig.pump();
	assert_eq!(pending.wait(), Ok(()));
	assert_eq!(handle.pointer_configuration(), Some(left.clone()));
	assert_eq!(mouse.pointer_settings(), Some(left));
	assert_eq!(observer.take(), vec![Seen::Changed(handle.id()), Seen::Complete]);
}

#[test]
fn invalid_or_unsupported_changes_fail_before_queueing() {
	let rig = Rig::new();
	let keyboard = keyboard("usb-kbd");
	let handle = rig.add(&keyboard);

	assert_eq!(
		handle
			.apply_pointer_configuration(PointerConfig::default())
			.err(),
		Some(DeviceError::Unsupported(DeviceCapabilities::POINTER))
	);
	let silent = KeyboardConfig {
		repeat_rate: 0,
		..KeyboardConfig::default()
	};
	assert!(matches!(
		handle.apply_keyboard_configuration(silent).err(),
		Some(DeviceError::OutOfRange {
			setting: "repeat_rate",
			..
		})
	));

	let touchpad = laptop_touchpad("i2c-touchpad");
	let handle = rig.add(&touchpad);
	let wild = PointerConfig {
		cursor_acceleration_bias: 2.0,
		..PointerConfig::default()
	};
	assert_eq!(
		handle.apply_pointer_configuration(wild).err(),
		Some(DeviceError::OutOfRange {
			setting: "cursor_acceleration_bias",
			value: 2.0
		})
	);
	let buttonless = TouchpadConfig {
		scroll_mode: TouchpadScrollMode::ButtonDownScroll,
		..TouchpadConfig::default()
	};
	assert!(handle.apply_touchpad_configuration(buttonless).is_err());
	rig.pump();
	assert_eq!(keyboard.applied_changes(), 0);
	assert_eq!(touchpad.applied_changes(), 0);
}

#[test]
fn rejected_change_keeps_the_old_configuration_and_stays_quiet() {
	let rig = Rig::new();
	let observer = rig.observe();
	let mouse = mouse("usb-mouse");
	let handle = rig.add(&mouse);
	rig.pump();
	observer.take();

	mouse.set_failing(true);
	let pending = handle
		.apply_pointer_configuration(PointerConfig {
			handedness: PointerHandedness::Left,
			..PointerConfig::default()
		})
		.unwrap();
	rig.pump();
	assert_eq!(
		pending.wait(),
		Err(DeviceError::Backend("injected failure".into()))
	);
	assert_eq!(handle.pointer_configuration(), Some(PointerConfig::default()));
	assert!(observer.take().is_empty());
}

#[test]
fn mutable_iteration_delivers_one_batch() {
	let rig = Rig::new();
	let observer = rig.observe();
	let touchpad = laptop_touchpad("i2c-touchpad");
	let (mouse, keyboard) = (mouse("usb-mouse"), keyboard("usb-kbd"));
	let ids = [rig.add(&touchpad), rig.add(&mouse), rig.add(&keyboard)].map(|handle| handle.id());
	rig.pump();
	observer.take();

	let mut pending = Vec::new();
	rig.hub.for_each_mutable_input_device(|device| {
		let caps = device.capabilities();
		if caps.contains(DeviceCapabilities::POINTER) {
			let natural = PointerConfig {
				vertical_scroll_scale: -1.0,
				..PointerConfig::default()
			};
			pending.push(device.apply_pointer_configuration(natural).unwrap());
		}
		if caps.contains(DeviceCapabilities::TOUCHPAD) {
			let no_tapping = TouchpadConfig {
				tap_to_click: false,
				..TouchpadConfig::default()
			};
			pending.push(device.apply_touchpad_configuration(no_tapping).unwrap());
		}
		if caps.contains(DeviceCapabilities::KEYBOARD) {
			let quick = KeyboardConfig {
				repeat_delay: 250,
				..KeyboardConfig::default()
			};
			pending.push(device.apply_keyboard_configuration(quick).unwrap());
		}
	});
	assert_eq!(pending.len(), 5);
	assert!(observer.take().is_empty());
	rig.pump();
	for change in pending {
		assert_eq!(change.wait(), Ok(()));
	}

	let seen = observer.take();
	assert_eq!(seen.len(), 4, "{seen:?}");
	for id in ids {
		assert!(seen[..3].contains(&Seen::Changed(id)), "{seen:?}");
	}
	assert_eq!(seen[3], Seen::Complete);
	assert_eq!(touchpad.applied_changes(), 3);
	assert_eq!(keyboard.keyboard_settings().unwrap().repeat_delay, 250);
}

#[test]
fn change_to_a_device_removed_mid_transaction_is_not_reported() {
	let rig = Rig::new();
	let observer = rig.observe();
	let mouse = mouse("usb-mouse");
	let handle = rig.add(&mouse);
	rig.pump();
	observer.take();

	rig.hub.for_each_mutable_input_device(|device| {
		let pending = device
			.apply_pointer_configuration(PointerConfig {
				handedness: PointerHandedness::Left,
				..PointerConfig::default()
			})
			.unwrap();
		rig.pump();
		assert_eq!(pending.wait(), Ok(()));
		rig.remove(&mouse);
	});
	rig.pump();

	assert_eq!(mouse.applied_changes(), 1);
	assert_eq!(
		observer.take(),
		vec![Seen::Removed(handle.id()), Seen::Complete]
	);
}

#[test]
fn read_only_iteration_sees_live_devices() {
	let rig = Rig::new();
	let (mouse, keyboard) = (mouse("usb-mouse"), keyboard("usb-kbd"));
	rig.add(&mouse);
	rig.add(&keyboard);
	rig.remove(&mouse);

	let mut names = Vec::new();
	rig.hub
		.for_each_input_device(|device| names.push(device.name().to_owned()));
	assert_eq!(names, vec!["keyboard usb-kbd".to_owned()]);
}

#[test]
fn queued_change_is_dropped_when_the_device_goes_away() {
	let rig = Rig::new();
	let observer = rig.observe();
	let mouse = mouse("usb-mouse");
	let handle = rig.add(&mouse);

	let pending = handle
		.apply_pointer_configuration(PointerConfig {
			handedness: PointerHandedness::Left,
			..PointerConfig::default()
		})
		.unwrap();
	rig.remove(&mouse);
	assert_eq!(pending.wait(), Err(DeviceError::Dropped));
	assert_eq!(mouse.applied_changes(), 0);

	rig.pump();
	assert_eq!(
		observer.take(),
		vec![
			Seen::Added(handle.id()),
			Seen::Complete,
			Seen::Removed(handle.id()),
			Seen::Complete,
		]
	);
	assert_eq!(
		handle
			.apply_pointer_configuration(PointerConfig::default())
			.err(),
		Some(DeviceError::Detached)
	);
	assert_eq!(handle.pointer_configuration(), Some(PointerConfig::default()));
}

#[test]
fn returning_device_gets_its_id_and_settings_back() {
	let rig = Rig::new();
	let first = mouse("usb-mouse");
	let handle = rig.add(&first);
	let left = PointerConfig {
		handedness: PointerHandedness::Left,
		..PointerConfig::default()
	};
	let pending = handle.apply_pointer_configuration(left.clone()).unwrap();
	rig.pump();
	assert_eq!(pending.wait(), Ok(()));
	rig.add(&keyboard("usb-kbd"));
	rig.remove(&first);

	let replug = mouse("usb-mouse");
	assert_eq!(replug.applied_changes(), 0);
	let restored = rig.add(&replug);
	assert_eq!(restored.id(), handle.id());
	assert_eq!(restored.pointer_configuration(), Some(left.clone()));

	rig.pump();
	assert_eq!(replug.applied_changes(), 1);
	assert_eq!(replug.pointer_settings(), Some(left));

	let newcomer = rig.add(&mouse("usb-other"));
	assert_eq!(newcomer.id(), DeviceId::from_raw(3));
}

#[test]
fn stored_configuration_survives_serialization() {
	let rig = Rig::new();
	let kbd = keyboard("usb-kbd");
	let handle = rig.add(&kbd);
	let pending = handle
		.apply_keyboard_configuration(KeyboardConfig {
			repeat_rate: 40,
			..KeyboardConfig::default()
		})
		.unwrap();
	rig.pump();
	assert_eq!(pending.wait(), Ok(()));
	rig.remove(&kbd);

	let exported = rig.hub.stored_configurations();
	assert_eq!(exported.len(), 1);
	let json = serde_json::to_string(&exported).unwrap();
	let stored: Vec<DeviceConfig> = serde_json::from_str(&json).unwrap();
	assert_eq!(stored, exported);

	let next = Rig::with_config(HubConfig {
		first_device_id: 1,
		stored_devices: stored,
	});
	let again = keyboard("usb-kbd");
	let handle = next.add(&again);
	assert_eq!(handle.id(), DeviceId::from_raw(1));
	assert_eq!(handle.keyboard_configuration().unwrap().repeat_rate, 40);
	assert_eq!(next.add(&mouse("usb-mouse")).id(), DeviceId::from_raw(2));
}

#[test]
fn late_observer_hears_about_existing_devices_first() {
	let rig = Rig::new();
	let (mouse, keyboard) = (mouse("usb-mouse"), keyboard("usb-kbd"));
	let first = rig.add(&mouse);
	let second = rig.add(&keyboard);
	rig.pump();

	let observer = Arc::new(common::RecordingObserver::default());
	let registered: Arc<dyn InputDeviceObserver> = observer.clone();
	rig.hub.add_observer(&registered).unwrap();
	rig.pump();
	assert_eq!(
		observer.take(),
		vec![Seen::Added(first.id()), Seen::Added(second.id()), Seen::Complete]
	);
	assert!(matches!(
		rig.hub.add_observer(&registered),
		Err(HubError::DuplicateObserver)
	));

	rig.remove(&mouse);
	rig.pump();
	assert_eq!(observer.take(), vec![Seen::Removed(first.id()), Seen::Complete]);
}

#[test]
fn registering_twice_before_the_replay_runs_is_refused() {
	let rig = Rig::new();
	let first = rig.add(&mouse("usb-mouse"));

	let observer = Arc::new(RecordingObserver::default());
	let registered: Arc<dyn InputDeviceObserver> = observer.clone();
	rig.hub.add_observer(&registered).unwrap();
	assert!(matches!(
		rig.hub.add_observer(&registered),
		Err(HubError::DuplicateObserver)
	));
	rig.pump();
	assert_eq!(
		observer.take(),
		vec![Seen::Added(first.id()), Seen::Complete]
	);
}

/// Adds a device to another hub and unregisters that hub's observer from a callback.
struct CrossHubObserver {
	other: Arc<DeviceHub>,
	device: Arc<VirtualDevice>,
	target: Arc<dyn InputDeviceObserver>,
	outcome: Mutex<Option<(DeviceHandle, bool)>>,
}

impl InputDeviceObserver for CrossHubObserver {
	fn device_added(&self, _device: &DeviceHandle) {
		let handle = self.other.add_device(backend(&self.device)).unwrap();
		let removed = self.other.remove_observer(&self.target).is_ok();
		self.outcome.lock().unwrap().get_or_insert((handle, removed));
	}
	fn device_changed(&self, _device: &DeviceHandle) {}
	fn device_removed(&self, _device: &DeviceHandle) {}
	fn changes_complete(&self) {}
}

#[test]
fn removal_from_another_hubs_callback_waits_for_queued_notifications() {
	let rig = Rig::new();
	let other = Arc::new(
		DeviceHub::new(
			rig.reactor.clone(),
			rig.seat.clone(),
			rig.status.clone(),
			HubConfig {
				first_device_id: 100,
				..HubConfig::default()
			},
		)
		.unwrap(),
	);
	let target = Arc::new(RecordingObserver::default());
	let cross = Arc::new(CrossHubObserver {
		other: other.clone(),
		device: keyboard("usb-kbd"),
		target: target.clone(),
		outcome: Mutex::new(None),
	});
	other.add_observer(&cross.target).unwrap();
	let registered: Arc<dyn InputDeviceObserver> = cross.clone();
	rig.hub.add_observer(&registered).unwrap();
	rig.pump();
	assert_eq!(target.take(), vec![Seen::Complete]);

	let pool = ThreadedDispatcher::new(
		"input-hub-test",
		rig.reactor.clone() as Arc<dyn Dispatchable>,
	)
	.unwrap();
	pool.add_thread().unwrap();
	rig.add(&mouse("usb-mouse"));

	let deadline = Instant::now() + Duration::from_secs(5);
	while cross.outcome.lock().unwrap().is_none() && Instant::now() < deadline {
		thread::sleep(Duration::from_millis(5));
	}
	let (handle, removed) = cross.outcome.lock().unwrap().take().unwrap();
	assert!(removed);
	// The other hub's queue was drained up to the removal before it returned.
	assert_eq!(target.take(), vec![Seen::Added(handle.id()), Seen::Complete]);
	drop(pool);
}

#[test]
fn observer_can_unregister_from_inside_a_callback() {
	let rig = Rig::new();
	let observer = SelfRemovingObserver::new(&rig.hub);
	let registered: Arc<dyn InputDeviceObserver> = observer.clone();
	rig.hub.add_observer(&registered).unwrap();
	rig.pump();

	let first = rig.add(&mouse("usb-mouse"));
	rig.pump();
	rig.add(&keyboard("usb-kbd"));
	rig.pump();

	assert_eq!(*observer.removal.lock().unwrap(), Some(Ok(())));
	assert_eq!(
		observer.record.take(),
		vec![Seen::Complete, Seen::Added(first.id()), Seen::Complete]
	);
}

#[test]
fn removed_observer_is_never_called_again() {
	let rig = Rig::new();
	let pool = ThreadedDispatcher::new(
		"input-hub-test",
		rig.reactor.clone() as Arc<dyn Dispatchable>,
	)
	.unwrap();
	pool.add_thread().unwrap();

	let observer = Arc::new(common::RecordingObserver::default());
	let registered: Arc<dyn InputDeviceObserver> = observer.clone();
	rig.hub.add_observer(&registered).unwrap();
	let handle = rig.add(&mouse("usb-mouse"));
	rig.hub.remove_observer(&registered).unwrap();

	let seen = observer.take();
	assert!(seen.contains(&Seen::Added(handle.id())), "{seen:?}");
	rig.add(&keyboard("usb-kbd"));
	thread::sleep(Duration::from_millis(50));
	assert_eq!(observer.len(), 0);
	assert!(matches!(
		rig.hub.remove_observer(&registered),
		Err(HubError::UnknownObserver)
	));
	drop(pool);
}

#[test]
fn device_input_reaches_the_seat_while_attached() {
	let rig = Rig::new();
	let keyboard = keyboard("usb-kbd");
	let handle = rig.add(&keyboard);

	assert!(keyboard.press_key(30));
	assert!(keyboard.release_key(30));
	{
		let events = rig.forwarded.events.lock().unwrap();
		assert_eq!(events.len(), 2);
		assert!(events.iter().all(|event| matches!(
			event,
			InputEvent::Key(key) if key.device_id == handle.id()
		)));
	}

	let mouse = mouse("usb-mouse");
	rig.add(&mouse);
	assert!(mouse.move_pointer(10.0, 20.0));
	assert_eq!(
		rig.seat.cursor_position(),
		shift_input::geometry::Point::new(10.0, 20.0)
	);

	rig.remove(&keyboard);
	assert!(!keyboard.press_key(31));
	assert_eq!(rig.forwarded.events.lock().unwrap().len(), 3);
	assert!(rig.seat.device_state().iter().all(|state| state.id != handle.id()));
}
