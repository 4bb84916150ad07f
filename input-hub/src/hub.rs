use std::{
	cell::Cell,
	sync::{Arc, Mutex, MutexGuard, PoisonError, Weak, mpsc},
};

use shift_dispatch::{ActionQueue, DispatchReentrancy, Dispatchable, MultiplexingDispatchable};

use crate::{
	DeviceHandle, DeviceId, HubError, InputDevice, InputDeviceObserver, InputSink, Seat,
	ServerStatusListener,
	config::{DeviceConfig, HubConfig},
	events::EventBuilder,
	handle::DeviceShared,
	registered::{DeviceSink, Lifecycle, RegisteredDevice},
};

thread_local! {
	/// Hub whose observer callbacks the current thread is running, or null.
	static DELIVERING: Cell<*const HubShared> = const { Cell::new(std::ptr::null()) };
}

/// Marks the current thread as running observer callbacks for one hub.
struct Delivering {
	previous: *const HubShared,
}

impl Delivering {
	fn enter(hub: &HubShared) -> Self {
		Self {
			previous: DELIVERING.with(|current| current.replace(hub as *const HubShared)),
		}
	}

	fn is_delivering(hub: &HubShared) -> bool {
		DELIVERING.with(|current| std::ptr::eq(current.get(), hub))
	}
}

impl Drop for Delivering {
	fn drop(&mut self) {
		DELIVERING.with(|current| current.set(self.previous));
	}
}

#[derive(Default)]
struct Batch {
	added: Vec<DeviceHandle>,
	changed: Vec<DeviceHandle>,
	removed: Vec<DeviceHandle>,
}

impl Batch {
	fn is_empty(&self) -> bool {
		self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
	}
}

#[derive(Default)]
struct Transaction {
	changed: Vec<DeviceHandle>,
	/// Changes queued during the transaction that have not settled yet.
	outstanding: usize,
	/// The iteration that opened the transaction has returned.
	closing: bool,
}

struct HubState {
	devices: Vec<RegisteredDevice>,
	stored: Vec<DeviceConfig>,
	next_id: u64,
	ready: bool,
	transaction: Option<Transaction>,
	observers: Vec<Weak<dyn InputDeviceObserver>>,
	/// Registered observers still waiting for their replay on the notification queue.
	pending_observers: Vec<Weak<dyn InputDeviceObserver>>,
	/// Devices observers have been told about; only touched on the notification queue.
	announced: Vec<DeviceHandle>,
}

pub(crate) struct HubShared {
	reactor: Arc<MultiplexingDispatchable>,
	seat: Arc<dyn Seat>,
	status: Arc<dyn ServerStatusListener>,
	notifications: Arc<ActionQueue>,
	state: Mutex<HubState>,
}

fn same_observer(weak: &Weak<dyn InputDeviceObserver>, target: *const ()) -> bool {
	std::ptr::eq(weak.as_ptr() as *const (), target)
}

impl HubState {
	fn knows_observer(&self, target: *const ()) -> bool {
		self
			.observers
			.iter()
			.chain(&self.pending_observers)
			.any(|registered| registered.strong_count() > 0 && same_observer(registered, target))
	}

	fn is_live(&self, device: &DeviceHandle) -> bool {
		self
			.devices
			.iter()
			.any(|entry| entry.is_live() && entry.handle == *device)
	}

	/// Ends the open transaction, keeping only changes to devices still present.
	fn finish_transaction(&mut self) -> Option<Batch> {
		let transaction = self.transaction.take()?;
		let changed = transaction
			.changed
			.into_iter()
			.filter(|device| self.is_live(device))
			.collect();
		Some(Batch {
			changed,
			..Batch::default()
		})
	}
}

impl HubShared {
	fn state(&self) -> MutexGuard<'_, HubState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn notify(self: &Arc<Self>, batch: Batch) {
		if batch.is_empty() {
			return;
		}
		let hub = Arc::downgrade(self);
		self.notifications.enqueue(move || {
			if let Some(hub) = hub.upgrade() {
				hub.deliver(batch);
			}
		});
	}

	fn deliver(&self, batch: Batch) {
		let observers = {
			let mut state = self.state();
			state.announced.retain(|device| !batch.removed.contains(device));
			state.announced.extend(batch.added.iter().cloned());
			state.observers.retain(|observer| observer.strong_count() > 0);
			state
				.observers
				.iter()
				.filter_map(Weak::upgrade)
				.collect::<Vec<_>>()
		};
		let _delivering = Delivering::enter(self);
		for observer in &observers {
			for device in &batch.added {
				observer.device_added(device);
			}
			for device in &batch.changed {
				observer.device_changed(device);
			}
			for device in &batch.removed {
				observer.device_removed(device);
			}
			observer.changes_complete();
		}
	}

	fn forget_observer(&self, target: *const ()) -> bool {
		let mut state = self.state();
		let before = state.observers.len() + state.pending_observers.len();
		state.observers.retain(|observer| !same_observer(observer, target));
		state
			.pending_observers
			.retain(|observer| !same_observer(observer, target));
		state.observers.len() + state.pending_observers.len() != before
	}

	/// Counts a newly queued change against the open transaction, if any.
	pub(crate) fn begin_change(&self) -> bool {
		match self.state().transaction.as_mut() {
			Some(transaction) => {
				transaction.outstanding += 1;
				true
			}
			None => false,
		}
	}

	pub(crate) fn finish_change(self: &Arc<Self>, counted: bool, changed: Option<DeviceHandle>) {
		let batch = {
			let mut state = self.state();
			if let Some(transaction) = state.transaction.as_mut() {
				if counted {
					transaction.outstanding = transaction.outstanding.saturating_sub(1);
				}
				if let Some(device) = changed {
					if !transaction.changed.contains(&device) {
						transaction.changed.push(device);
					}
				}
				let done = transaction.closing && transaction.outstanding == 0;
				if done {
					state.finish_transaction()
				} else {
					None
				}
			} else {
				changed.map(|device| Batch {
					changed: vec![device],
					..Batch::default()
				})
			}
		};
		if let Some(batch) = batch {
			self.notify(batch);
		}
	}

	fn close_transaction(self: &Arc<Self>) {
		let batch = {
			let mut state = self.state();
			let Some(transaction) = state.transaction.as_mut() else {
				return;
			};
			transaction.closing = true;
			if transaction.outstanding > 0 {
				return;
			}
			state.finish_transaction()
		};
		if let Some(batch) = batch {
			self.notify(batch);
		}
	}

	fn live_handles(&self) -> Vec<DeviceHandle> {
		self
			.state()
			.devices
			.iter()
			.filter(|entry| entry.is_live())
			.map(|entry| entry.handle.clone())
			.collect()
	}
}

/// Registry of input devices.
///
/// Starts each added device against the seat with its own action queue on the
/// shared reactor, remembers configuration of removed devices by unique id,
/// and tells observers about lifecycle changes from its own notification queue.
pub struct DeviceHub {
	shared: Arc<HubShared>,
}

impl DeviceHub {
	pub fn new(
		reactor: Arc<MultiplexingDispatchable>,
		seat: Arc<dyn Seat>,
		status: Arc<dyn ServerStatusListener>,
		config: HubConfig,
	) -> Result<Self, HubError> {
		let notifications = Arc::new(ActionQueue::new()?);
		reactor.add_watch(
			&(Arc::clone(&notifications) as Arc<dyn Dispatchable>),
			DispatchReentrancy::Sequential,
		)?;
		let next_id = config.seed_id();
		Ok(Self {
			shared: Arc::new(HubShared {
				reactor,
				seat,
				status,
				notifications,
				state: Mutex::new(HubState {
					devices: Vec::new(),
					stored: config.stored_devices,
					next_id,
					ready: false,
					transaction: None,
					observers: Vec::new(),
					pending_observers: Vec::new(),
					announced: Vec::new(),
				}),
			}),
		})
	}

	/// Registers and starts `device`.
	///
	/// A device whose unique id matches stored configuration gets its old id
	/// back and has the stored settings re-applied on its queue.
	#[tracing::instrument(skip_all)]
	pub fn add_device(&self, device: Arc<dyn InputDevice>) -> Result<DeviceHandle, HubError> {
		let info = device.device_info();
		let queue = Arc::new(ActionQueue::new()?);
		let fresh = DeviceConfig::from_backend(DeviceId::from_raw(0), info.clone(), device.as_ref());

		let (handle, sink, restored) = {
			let mut state = self.shared.state();
			if state
				.devices
				.iter()
				.any(|entry| Arc::ptr_eq(&entry.handle.shared.backend, &device))
			{
				tracing::error!(device = %info.name, "input device added twice");
				return Err(HubError::AlreadyManaged(info.name));
			}
			let stored = state
				.stored
				.iter()
				.position(|stored| stored.info.unique_id == info.unique_id)
				.map(|pos| state.stored.remove(pos));
			let restored = stored.is_some();
			let config = match stored {
				Some(stored) => stored.restore(fresh),
				None => {
					let id = DeviceId::from_raw(state.next_id);
					state.next_id += 1;
					DeviceConfig { id, ..fresh }
				}
			};
			let id = config.id;
			let handle = DeviceHandle {
				shared: Arc::new(DeviceShared {
					id,
					info: info.clone(),
					config: Mutex::new(config),
					queue: Mutex::new(Some(Arc::clone(&queue))),
					backend: Arc::clone(&device),
					hub: Arc::downgrade(&self.shared),
				}),
			};
			let sink = Arc::new(DeviceSink::new(id));
			state
				.devices
				.push(RegisteredDevice::new(handle.clone(), Arc::clone(&sink)));
			(handle, sink, restored)
		};
		let id = handle.id();

		let watched: Arc<dyn Dispatchable> = Arc::clone(&queue) as _;
		if let Err(error) = self
			.shared
			.reactor
			.add_watch(&watched, DispatchReentrancy::Sequential)
		{
			self.abandon(&handle, restored);
			return Err(error.into());
		}

		self.shared.seat.add_device(id);
		sink.attach(Arc::clone(&self.shared.seat));
		device.start(Arc::clone(&sink) as Arc<dyn InputSink>, EventBuilder::new(id));

		{
			let mut state = self.shared.state();
			if let Some(entry) = state.devices.iter_mut().find(|entry| entry.handle == handle) {
				entry.state = Lifecycle::Started;
			}
			if !state.ready {
				state.ready = true;
				self.shared.status.ready_for_user_input();
			}
		}

		if restored {
			let replay = handle.clone();
			queue.enqueue(move || {
				let config = replay.configuration();
				if let Err(error) = config.apply_to(replay.shared.backend.as_ref()) {
					tracing::warn!(device = %replay.id(), %error, "failed to restore stored configuration");
				}
			});
		}
		self.shared.notify(Batch {
			added: vec![handle.clone()],
			..Batch::default()
		});
		tracing::info!(device = %id, name = %info.name, restored, "input device added");
		Ok(handle)
	}

	/// Undoes the registration of a device whose start failed.
	fn abandon(&self, handle: &DeviceHandle, restored: bool) {
		let config = handle.configuration();
		let entry = {
			let mut state = self.shared.state();
			if restored {
				state.stored.push(config);
			}
			state
				.devices
				.iter()
				.position(|entry| entry.handle == *handle)
				.map(|pos| state.devices.remove(pos))
		};
		let queue = handle
			.shared
			.queue
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
		drop(entry);
		drop(queue);
	}

	/// Stops and unregisters `device`, remembering its configuration.
	///
	/// Configuration changes still queued for the device are dropped without
	/// notification.
	#[tracing::instrument(skip_all)]
	pub fn remove_device(&self, device: &Arc<dyn InputDevice>) -> Result<(), HubError> {
		let found = {
			let mut state = self.shared.state();
			state
				.devices
				.iter_mut()
				.find(|entry| entry.is_live() && Arc::ptr_eq(&entry.handle.shared.backend, device))
				.map(|entry| {
					entry.state = Lifecycle::Stopping;
					(entry.handle.clone(), Arc::clone(&entry.sink))
				})
		};
		let Some((handle, sink)) = found else {
			let name = device.device_info().name;
			tracing::error!(device = %name, "input device not managed by the hub");
			return Err(HubError::NotManaged(name));
		};
		let id = handle.id();

		let queue = handle
			.shared
			.queue
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
		if let Some(queue) = &queue {
			if let Err(error) = self.shared.reactor.remove_watch(queue.as_ref()) {
				tracing::warn!(device = %id, %error, "device queue was not watched");
			}
		}
		device.stop();
		sink.detach();
		self.shared.seat.remove_device(id);

		let config = handle.configuration();
		let entry = {
			let mut state = self.shared.state();
			let entry = state
				.devices
				.iter()
				.position(|entry| entry.handle == handle)
				.map(|pos| state.devices.remove(pos));
			state
				.stored
				.retain(|stored| stored.info.unique_id != config.info.unique_id);
			state.stored.push(config);
			if state.ready && !state.devices.iter().any(RegisteredDevice::is_live) {
				state.ready = false;
				self.shared.status.stop_receiving_input();
			}
			entry
		};
		// Dropping the queue settles its pending changes, which takes the lock.
		drop(entry);
		drop(queue);

		self.shared.notify(Batch {
			removed: vec![handle],
			..Batch::default()
		});
		tracing::info!(device = %id, "input device removed");
		Ok(())
	}

	/// Registers `observer`, held weakly.
	///
	/// It first receives `device_added` for every device already announced,
	/// followed by `changes_complete`, then every later batch.
	pub fn add_observer(&self, observer: &Arc<dyn InputDeviceObserver>) -> Result<(), HubError> {
		let target = Arc::as_ptr(observer) as *const ();
		let observer = Arc::downgrade(observer);
		{
			let mut state = self.shared.state();
			if state.knows_observer(target) {
				return Err(HubError::DuplicateObserver);
			}
			state.pending_observers.push(observer.clone());
		}

		let hub = Arc::downgrade(&self.shared);
		self.shared.notifications.enqueue(move || {
			let Some(hub) = hub.upgrade() else {
				return;
			};
			let (announced, observer) = {
				let mut state = hub.state();
				let target = observer.as_ptr() as *const ();
				// Gone if it was removed before its replay ran.
				let Some(pos) = state
					.pending_observers
					.iter()
					.position(|pending| same_observer(pending, target))
				else {
					return;
				};
				let pending = state.pending_observers.remove(pos);
				let Some(observer) = pending.upgrade() else {
					return;
				};
				state.observers.push(pending);
				(state.announced.clone(), observer)
			};
			let _delivering = Delivering::enter(&hub);
			for device in &announced {
				observer.device_added(device);
			}
			observer.changes_complete();
		});
		Ok(())
	}

	/// Unregisters `observer`.
	///
	/// Blocks until notifications already queued have been delivered, so no
	/// callback on `observer` runs after this returns. From inside one of this
	/// hub's observer callbacks the removal happens immediately instead.
	pub fn remove_observer(&self, observer: &Arc<dyn InputDeviceObserver>) -> Result<(), HubError> {
		let target = Arc::as_ptr(observer) as *const ();
		if Delivering::is_delivering(&self.shared) {
			return match self.shared.forget_observer(target) {
				true => Ok(()),
				false => Err(HubError::UnknownObserver),
			};
		}

		let (done, removed) = mpsc::channel();
		let hub = Arc::downgrade(&self.shared);
		let observer = Arc::downgrade(observer);
		self.shared.notifications.enqueue(move || {
			let target = observer.as_ptr() as *const ();
			let found = hub.upgrade().is_some_and(|hub| hub.forget_observer(target));
			let _ = done.send(found);
		});
		match removed.recv() {
			Ok(true) => Ok(()),
			Ok(false) => Err(HubError::UnknownObserver),
			// The queue went away with everything on it.
			Err(_) => Ok(()),
		}
	}

	/// Runs `callback` for each live device, outside the registry lock.
	pub fn for_each_input_device(&self, mut callback: impl FnMut(&DeviceHandle)) {
		for device in self.shared.live_handles() {
			callback(&device);
		}
	}

	/// Runs `callback` for each live device as one transaction.
	///
	/// Changes applied from the callback, or anywhere else while it runs, are
	/// delivered to observers as a single batch once all of them have been
	/// applied. Nested calls join the outer transaction.
	pub fn for_each_mutable_input_device(&self, mut callback: impl FnMut(&DeviceHandle)) {
		let opened = {
			let mut state = self.shared.state();
			let opened = state.transaction.is_none();
			if opened {
				state.transaction = Some(Transaction::default());
			}
			opened
		};
		for device in self.shared.live_handles() {
			callback(&device);
		}
		if opened {
			self.shared.close_transaction();
		}
	}

	pub fn devices(&self) -> Vec<DeviceHandle> {
		self.shared.live_handles()
	}

	pub fn device_count(&self) -> usize {
		self.shared.live_handles().len()
	}

	/// Every configuration the hub knows: live devices first, then remembered ones.
	pub fn stored_configurations(&self) -> Vec<DeviceConfig> {
		let (live, stored) = {
			let state = self.shared.state();
			let live = state
				.devices
				.iter()
				.filter(|entry| entry.is_live())
				.map(|entry| entry.handle.clone())
				.collect::<Vec<_>>();
			(live, state.stored.clone())
		};
		live
			.iter()
			.map(DeviceHandle::configuration)
			.chain(stored)
			.collect()
	}
}

impl Drop for DeviceHub {
	fn drop(&mut self) {
		let backends = self
			.shared
			.live_handles()
			.into_iter()
			.map(|handle| Arc::clone(&handle.shared.backend))
			.collect::<Vec<_>>();
		for backend in backends {
			if let Err(error) = self.remove_device(&backend) {
				tracing::warn!(%error, "failed to remove device while dropping hub");
			}
		}
		if let Err(error) = self
			.shared
			.reactor
			.remove_watch(self.shared.notifications.as_ref())
		{
			tracing::warn!(%error, "hub notification queue was not watched");
		}
	}
}
