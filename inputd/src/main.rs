mod config;

use std::sync::Arc;

use anyhow::Context;
use config::DaemonConfig;
use nix::sys::signal::{SigSet, Signal};
use shift_dispatch::{Dispatchable, MultiplexingDispatchable, ThreadedDispatcher};
use shift_input::{
	DeviceHandle, DeviceHub, HubConfig, InputDevice, InputDeviceObserver, InputDispatcher,
	InputEvent, SeatTracker, ServerStatusListener, VirtualDevice,
};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt};

struct LogObserver;

impl InputDeviceObserver for LogObserver {
	fn device_added(&self, device: &DeviceHandle) {
		info!(device = %device.id(), name = %device.name(), capabilities = ?device.capabilities(), "device added");
	}

	fn device_changed(&self, device: &DeviceHandle) {
		info!(device = %device.id(), config = ?device.configuration(), "device configuration changed");
	}

	fn device_removed(&self, device: &DeviceHandle) {
		info!(device = %device.id(), name = %device.name(), "device removed");
	}

	fn changes_complete(&self) {
		debug!("device changes complete");
	}
}

struct LogStatus;

impl ServerStatusListener for LogStatus {
	fn ready_for_user_input(&self) {
		info!("ready for user input");
	}

	fn stop_receiving_input(&self) {
		info!("no input devices left");
	}
}

struct LogDispatcher;

impl InputDispatcher for LogDispatcher {
	fn dispatch(&self, event: &InputEvent) {
		debug!(device = %event.device_id(), ?event, "input event");
	}
}

fn main() -> anyhow::Result<()> {
	let _ = fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.try_init();
	if let Err(err) = run() {
		error!(error = ?err, "shift-inputd failed");
		return Err(err);
	}
	Ok(())
}

fn run() -> anyhow::Result<()> {
	let config = DaemonConfig::from_env();
	let hub_config = HubConfig::from_env();

	// Blocked before any thread exists so only `wait` below ever sees them.
	let mut termination = SigSet::empty();
	termination.add(Signal::SIGINT);
	termination.add(Signal::SIGTERM);
	termination
		.thread_block()
		.context("failed to block termination signals")?;

	let reactor = Arc::new(MultiplexingDispatchable::new()?);
	let pool = ThreadedDispatcher::new(
		config.pool_name.clone(),
		Arc::clone(&reactor) as Arc<dyn Dispatchable>,
	)?;
	for _ in 1..config.threads {
		pool.add_thread()?;
	}
	info!(pool = %pool.name(), threads = pool.thread_count(), "dispatch pool running");

	let seat = Arc::new(SeatTracker::new(Arc::new(LogDispatcher)));
	let hub = DeviceHub::new(Arc::clone(&reactor), seat, Arc::new(LogStatus), hub_config)?;
	let observer: Arc<dyn InputDeviceObserver> = Arc::new(LogObserver);
	hub.add_observer(&observer)?;

	let mut devices = Vec::with_capacity(config.virtual_devices.len());
	for spec in &config.virtual_devices {
		let name = format!("virtual {:?}", spec.kind).to_lowercase();
		let device: Arc<dyn InputDevice> = Arc::new(VirtualDevice::new(
			name,
			spec.unique_id.clone(),
			spec.kind.capabilities(),
		));
		hub.add_device(Arc::clone(&device))
			.with_context(|| format!("failed to add virtual device {}", spec.unique_id))?;
		devices.push(device);
	}

	let signal = termination
		.wait()
		.context("failed waiting for termination signal")?;
	info!(?signal, "shutting down");

	for device in &devices {
		hub.remove_device(device)?;
	}
	hub.remove_observer(&observer)?;
	info!(
		remembered = hub.stored_configurations().len(),
		"input devices released"
	);
	drop(hub);
	drop(pool);
	Ok(())
}
