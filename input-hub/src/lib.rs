//! Input device registry for the shift compositor.
//!
//! [`DeviceHub`] owns the lifecycle of every [`InputDevice`] a platform
//! backend reports: it hands out ids, starts devices against a [`Seat`] with
//! a per-device [`shift_dispatch::ActionQueue`] on a shared reactor, applies
//! configuration changes on those queues, and restores a device's settings
//! when it reappears.

pub mod config;
mod device;
mod error;
pub mod events;
pub mod geometry;
mod handle;
mod hub;
mod ids;
mod observer;
mod registered;
mod seat;
mod virtual_device;

pub use config::{
	DeviceConfig, HubConfig, KeyboardConfig, PointerConfig, TouchpadConfig, TouchscreenConfig,
};
pub use device::{DeviceCapabilities, DeviceInfo, InputDevice, InputSink};
pub use error::{DeviceError, HubError};
pub use events::{EventBuilder, InputEvent, PointerButtons};
pub use handle::{DeviceHandle, PendingChange};
pub use hub::DeviceHub;
pub use ids::{DeviceId, DeviceIdParseError};
pub use observer::{InputDeviceObserver, ServerStatusListener};
pub use seat::{DeviceState, InputDispatcher, Seat, SeatTracker};
pub use virtual_device::VirtualDevice;
