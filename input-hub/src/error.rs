use shift_dispatch::DispatchError;
use thiserror::Error;

use crate::DeviceCapabilities;

/// Misuse of the hub, reported synchronously before anything is changed.
#[derive(Error, Debug)]
pub enum HubError {
	#[error("input device {0} is already managed by the hub")]
	AlreadyManaged(String),
	#[error("input device {0} is not managed by the hub")]
	NotManaged(String),
	#[error("observer is already registered")]
	DuplicateObserver,
	#[error("observer is not registered")]
	UnknownObserver,
	#[error("dispatch error: {0}")]
	Dispatch(#[from] DispatchError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
	#[error("device does not support {0:?} configuration")]
	Unsupported(DeviceCapabilities),
	#[error("{setting} value {value} is out of range")]
	OutOfRange { setting: &'static str, value: f64 },
	#[error("device has been removed from the hub")]
	Detached,
	#[error("backend rejected configuration: {0}")]
	Backend(String),
	#[error("queued configuration change was dropped before it ran")]
	Dropped,
}
