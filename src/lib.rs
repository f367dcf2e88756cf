//! # usbtmc
//!
//! A host-side driver for the USB Test and Measurement Class (USBTMC)
//! protocol: opening an instrument's USBTMC interface, framing SCPI-style
//! commands into `DEV_DEP_MSG_OUT` bulk transfers, requesting and
//! reassembling `DEV_DEP_MSG_IN` replies, and running the class-specific
//! abort/clear/capability control requests. The optional USB488 sub-class
//! (remote/local/lock/trigger/status-byte) is used when the device advertises
//! it, but every operation that isn't USB488-specific works against a plain
//! USBTMC device.
//!
//! ## Example
//!
//! ```no_run
//! use usbtmc::Instrument;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut scope = Instrument::open((0x0957, 0x1755), None)?;
//! let idn = scope.ask("*IDN?", None)?;
//! println!("{idn}");
//! # Ok(())
//! # }
//! ```

mod communication {
    pub mod bulk;
    pub mod control;
}
mod constants;
mod descriptor;
mod devices;
mod error;
mod header;
mod resource;
mod tag;
mod transport;
mod types;


pub use devices::DeviceFilter;
pub use error::Error;
pub use types::{Capabilities, DeviceAddr, DeviceId, DeviceInfo};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{info, warn};
use rusb::Context;

use anyhow::Result;

use communication::{bulk, control};
use constants::misc::{DEFAULT_MAX_TRANSFER_SIZE, DEFAULT_TIMEOUT_DURATION};
use tag::TagAllocator;
use types::{DeviceMode, Handle, Timeout, UsbtmcEndpoints};

/// An open connection to one USBTMC interface.
///
/// Not `Clone`: every operation that performs USB I/O takes `&mut self`, so
/// the borrow checker — not a runtime lock — enforces that only one bulk or
/// control exchange is in flight on a session at a time. Configuration
/// setters (`set_timeout`, `set_term_char`, ...) take `&self` and may be
/// called at any point, including from another thread holding a reference.
#[derive(Debug)]
pub struct Instrument {
    handle: Handle,
    mode: DeviceMode,
    endpoints: UsbtmcEndpoints,
    timeout: Timeout,
    capabilities: Capabilities,
    tags: TagAllocator,
    status_tags: TagAllocator,
    max_transfer_size: AtomicU32,
    term_char: Mutex<Option<u8>>,
    advantest_quirk: AtomicBool,
    closed: AtomicBool,
}

impl Instrument {
    /// List every attached device exposing a USBTMC interface.
    pub fn devices() -> Result<Vec<DeviceInfo>> {
        let mut context = Context::new()?;
        Ok(devices::list_devices(&mut context)?)
    }

    /// Open a device matching `filter` (and, if given, `serial`).
    ///
    /// `filter` accepts `()` (first USBTMC device found), `(vid, pid)` /
    /// [`DeviceId`], `(bus, address)` / [`DeviceAddr`], or [`DeviceInfo`] for
    /// both at once.
    pub fn open(filter: impl DeviceFilter, serial: Option<&str>) -> Result<Instrument> {
        let mut context = Context::new()?;
        let (device, mut raw_handle) = devices::open_device(&mut context, filter, serial)?;

        let mut mode = descriptor::get_usbtmc_mode(&device)?;
        descriptor::detach_kernel_driver(&mut mode, &mut raw_handle)?;
        let endpoints = descriptor::get_endpoints(&mode, &device)?;

        raw_handle.set_active_configuration(mode.config_number)?;
        raw_handle.claim_interface(mode.interface_number)?;
        raw_handle.set_alternate_setting(mode.interface_number, mode.setting_number)?;

        let handle = Handle::new(raw_handle);
        let timeout = Timeout::new(DEFAULT_TIMEOUT_DURATION);

        let capabilities = control::get_capabilities(&handle, mode.interface_number, &timeout)?;

        control::clear(&handle, mode.interface_number, &endpoints.bulk_out_ep, &endpoints.bulk_in_ep, &timeout)?;
        control::clear_feature(&handle, &endpoints.bulk_in_ep)?;

        info!(
            "opened USBTMC interface {} (usb488={})",
            mode.interface_number, mode.usb488
        );

        Ok(Instrument {
            handle,
            mode,
            endpoints,
            timeout,
            capabilities,
            tags: TagAllocator::new(),
            status_tags: TagAllocator::bounded(127),
            max_transfer_size: AtomicU32::new(DEFAULT_MAX_TRANSFER_SIZE),
            term_char: Mutex::new(None),
            advantest_quirk: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Open a device addressed by a `USB[N]::vid::pid[::serial]::INSTR`
    /// resource string.
    pub fn open_resource(resource: &str) -> Result<Instrument> {
        let parsed = resource::parse(resource)?;
        Instrument::open((parsed.vendor_id, parsed.product_id), parsed.serial.as_deref())
    }

    /// Release the interface and, if it was detached on open, reattach the
    /// kernel driver. Idempotent — safe to call even if a prior operation
    /// already failed, and safe to omit (the same cleanup runs on `Drop`).
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing USBTMC interface {}", self.mode.interface_number);
        self.handle.borrow().release_interface(self.mode.interface_number)?;
        if self.mode.has_kernel_driver {
            self.handle.borrow().attach_kernel_driver(self.mode.interface_number)?;
        }
        Ok(())
    }

    fn require_usb488(&self) -> Result<(), Error> {
        if self.mode.usb488 {
            Ok(())
        } else {
            Err(Error::NotSupported)
        }
    }

    /// Write raw bytes as one or more `DEV_DEP_MSG_OUT` messages.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        Ok(bulk::write(
            &self.handle,
            &self.tags,
            data,
            &self.endpoints.bulk_out_ep,
            self.max_transfer_size.load(Ordering::Relaxed),
            &self.timeout,
        )?)
    }

    /// Write `text`, appending a newline if it doesn't already end in one.
    pub fn write(&mut self, text: &str) -> Result<()> {
        let mut payload = text.as_bytes().to_vec();
        if !payload.ends_with(b"\n") {
            payload.push(b'\n');
        }
        self.write_raw(&payload)
    }

    /// Request and reassemble a reply, at most `max_len` bytes (default
    /// `max_transfer_size`).
    pub fn read_raw(&mut self, max_len: Option<usize>) -> Result<Vec<u8>> {
        let max_transfer_size = self.max_transfer_size.load(Ordering::Relaxed);
        let max_len = max_len.unwrap_or(max_transfer_size as usize);
        let term_char = if self.capabilities.supports_bulk_in_term_char {
            *self.term_char.lock().unwrap()
        } else {
            None
        };

        Ok(bulk::read(
            &self.handle,
            &self.tags,
            &self.endpoints.bulk_in_ep,
            &self.endpoints.bulk_out_ep,
            max_transfer_size,
            max_len,
            term_char,
            self.advantest_quirk.load(Ordering::Relaxed),
            &self.timeout,
        )?)
    }

    /// Like [`Instrument::read_raw`], decoded as UTF-8 with one trailing
    /// `\n` (and a preceding `\r`, if present) trimmed.
    pub fn read(&mut self, max_len: Option<usize>) -> Result<String> {
        let bytes = self.read_raw(max_len)?;
        let text = std::str::from_utf8(&bytes).map_err(|e| Error::IoError(e.to_string()))?;
        Ok(text.trim_end_matches('\n').trim_end_matches('\r').to_string())
    }

    /// `write_raw` followed by `read_raw`. Skips the read if the write fails.
    pub fn ask_raw(&mut self, data: &[u8], max_len: Option<usize>) -> Result<Vec<u8>> {
        self.write_raw(data)?;
        self.read_raw(max_len)
    }

    /// `write` followed by `read`. Skips the read if the write fails.
    pub fn ask(&mut self, text: &str, max_len: Option<usize>) -> Result<String> {
        self.write(text)?;
        self.read(max_len)
    }

    /// Run the device-level `INITIATE_CLEAR` / `CHECK_CLEAR_STATUS`
    /// recovery, discarding any buffered input or in-progress transfer.
    pub fn clear(&mut self) -> Result<()> {
        Ok(control::clear(
            &self.handle,
            self.mode.interface_number,
            &self.endpoints.bulk_out_ep,
            &self.endpoints.bulk_in_ep,
            &self.timeout,
        )?)
    }

    /// Send the USB488 `TRIGGER` bulk message. `NotSupported` on a device
    /// that doesn't advertise the USB488 sub-class.
    pub fn trigger(&mut self) -> Result<()> {
        self.require_usb488()?;
        Ok(bulk::trigger(&self.handle, &self.tags, &self.endpoints.bulk_out_ep, &self.timeout)?)
    }

    /// USB488 `REN_CONTROL`: assert remote-enable.
    pub fn remote(&mut self) -> Result<()> {
        self.require_usb488()?;
        Ok(control::ren_control(&self.handle, self.mode.interface_number, true, &self.timeout)?)
    }

    /// USB488 `GO_TO_LOCAL`: drop the device out of remote mode.
    pub fn local(&mut self) -> Result<()> {
        self.require_usb488()?;
        Ok(control::go_to_local(&self.handle, self.mode.interface_number, &self.timeout)?)
    }

    /// USB488 `LOCAL_LOCKOUT`: disable the device's front-panel
    /// return-to-local control.
    pub fn lock(&mut self) -> Result<()> {
        self.require_usb488()?;
        Ok(control::local_lockout(&self.handle, self.mode.interface_number, &self.timeout)?)
    }

    /// USB488 `REN_CONTROL`: release remote-enable.
    pub fn unlock(&mut self) -> Result<()> {
        self.require_usb488()?;
        Ok(control::ren_control(&self.handle, self.mode.interface_number, false, &self.timeout)?)
    }

    /// USB488 `READ_STATUS_BYTE`: poll the IEEE-488 status byte.
    pub fn read_stb(&mut self) -> Result<u8> {
        self.require_usb488()?;
        let tag = self.status_tags.next();
        Ok(control::read_status_byte(&self.handle, self.mode.interface_number, tag, &self.timeout)?)
    }

    /// Ask the device to flash its activity indicator. `NotSupported` if the
    /// device's `GET_CAPABILITIES` response didn't advertise the feature.
    pub fn indicator_pulse(&mut self) -> Result<()> {
        if !self.capabilities.accepts_indicator_pulse_request {
            return Err(Error::NotSupported.into());
        }
        Ok(control::indicator_pulse(&self.handle, self.mode.interface_number, &self.timeout)?)
    }

    /// The per-operation timeout currently in effect.
    pub fn timeout(&self) -> Duration {
        self.timeout.get()
    }

    /// Set the per-operation timeout used by every subsequent bulk/control
    /// transfer.
    pub fn set_timeout(&self, duration: Duration) {
        *self.timeout.borrow() = duration;
    }

    /// The cap on a single `DEV_DEP_MSG_OUT`/`DEV_DEP_MSG_IN` fragment's
    /// payload.
    pub fn max_transfer_size(&self) -> u32 {
        self.max_transfer_size.load(Ordering::Relaxed)
    }

    /// Set the cap on a single bulk fragment's payload, used both to
    /// fragment outgoing writes and to bound the per-read buffer.
    pub fn set_max_transfer_size(&self, size: u32) {
        self.max_transfer_size.store(size, Ordering::Relaxed);
    }

    /// Set the terminator byte requested on `REQUEST_DEV_DEP_MSG_IN`
    /// headers. Only takes effect if the device's `GET_CAPABILITIES`
    /// response advertised TermChar support.
    pub fn set_term_char(&self, term_char: Option<u8>) {
        *self.term_char.lock().unwrap() = term_char;
    }

    /// Enable or disable the Advantest quirk: skip the
    /// `REQUEST_DEV_DEP_MSG_IN` header and read bulk-IN directly.
    pub fn set_advantest_quirk(&self, enabled: bool) {
        self.advantest_quirk.store(enabled, Ordering::Relaxed);
    }

    /// The capability record decoded from `GET_CAPABILITIES` at open time.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Whether the device advertised the USB488 sub-class
    /// (`bInterfaceProtocol == 0x01`).
    pub fn is_usb488(&self) -> bool {
        self.mode.usb488
    }

    /// Build an instrument directly from a transport, bypassing device
    /// discovery — used by the mock-driven end-to-end test suite.
    #[cfg(test)]
    fn from_transport(
        handle: Handle,
        mode: DeviceMode,
        endpoints: UsbtmcEndpoints,
        capabilities: Capabilities,
    ) -> Instrument {
        Instrument {
            handle,
            mode,
            endpoints,
            timeout: Timeout::new(DEFAULT_TIMEOUT_DURATION),
            capabilities,
            tags: TagAllocator::new(),
            status_tags: TagAllocator::bounded(127),
            max_transfer_size: AtomicU32::new(DEFAULT_MAX_TRANSFER_SIZE),
            term_char: Mutex::new(None),
            advantest_quirk: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

impl Drop for Instrument {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            warn!("error releasing USBTMC interface on drop: {e}");
        }
    }
}
