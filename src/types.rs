//! ## Types
//!
//! The data model shared across the crate (§3): the session's resolved
//! identity/endpoints, the USB transport handle, and the small value types
//! (`Endpoint`, `Capabilities`, ...) the protocol engine and control façade
//! pass around.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusb::{Direction, TransferType};

use crate::transport::UsbTransport;

/// A USB transport, shared cheaply and locked for the duration of each call.
/// Holds a `dyn UsbTransport` so the protocol engine runs unmodified against
/// either a real `rusb::DeviceHandle` or [`crate::transport::mock::MockTransport`].
#[derive(Clone)]
pub struct Handle(Arc<Mutex<Box<dyn UsbTransport + Send>>>);

impl Handle {
    pub fn new(transport: impl UsbTransport + Send + 'static) -> Handle {
        Handle(Arc::new(Mutex::new(Box::new(transport))))
    }

    pub fn borrow(&self) -> MutexGuard<'_, Box<dyn UsbTransport + Send>> {
        self.0.lock().unwrap()
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}

/// Shared, mutable per-operation timeout.
#[derive(Debug, Clone)]
pub struct Timeout(Arc<Mutex<Duration>>);

impl Timeout {
    pub fn new(duration: Duration) -> Timeout {
        Timeout(Arc::new(Mutex::new(duration)))
    }

    pub fn borrow(&self) -> MutexGuard<'_, Duration> {
        self.0.lock().unwrap()
    }

    pub fn get(&self) -> Duration {
        *self.0.lock().unwrap()
    }
}

/// USB device address (bus, device number).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceAddr {
    pub bus: u8,
    pub device: u8,
}

/// USB vendor/product identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Identity + address of one discovered USBTMC device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub address: DeviceAddr,
}

/// The configuration/interface/alternate-setting a device's USBTMC
/// interface was found at, resolved once at open time.
#[derive(Debug, Clone, Default)]
pub struct DeviceMode {
    pub config_number: u8,
    pub interface_number: u8,
    pub setting_number: u8,
    /// `bInterfaceProtocol == 0x01`: the device also speaks USB488.
    pub usb488: bool,
    pub has_kernel_driver: bool,
}

/// One endpoint of the resolved USBTMC interface alternate.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub address: u8,
    pub max_packet_size: u16,
    pub transfer_type: TransferType,
    pub direction: Direction,
}

/// The mandatory bulk endpoints and optional interrupt-IN endpoint of a
/// USBTMC interface.
#[derive(Clone, Debug)]
pub struct UsbtmcEndpoints {
    pub bulk_out_ep: Endpoint,
    pub bulk_in_ep: Endpoint,
    pub interrupt_ep: Option<Endpoint>,
}

/// Decoded `GET_CAPABILITIES` response.
#[derive(Clone, Copy, Debug, Default)]
pub struct Capabilities {
    pub bcd_version: u16,
    pub accepts_indicator_pulse_request: bool,
    pub is_talk_only: bool,
    pub is_listen_only: bool,
    /// Device capability bit: the device can end a Bulk-IN transfer on a
    /// requested TermChar (what §3 calls "supports EOM on bulk-in" via TermChar).
    pub supports_bulk_in_term_char: bool,
}
