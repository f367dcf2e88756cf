//! ## Transport
//!
//! Thin abstraction over the host USB library (component 1 of the driver):
//! control transfers, bulk reads/writes, endpoint halt-clearing and
//! interface claim/release/configuration. The bulk protocol engine and the
//! control-request façade only ever talk to a `dyn UsbTransport`, which lets
//! them run unmodified against either a real `rusb` device handle or the
//! in-memory [`mock`] backend used by tests.

use std::time::Duration;

use crate::error::Error;

pub type TransportResult<T> = Result<T, Error>;

/// The operations the protocol engine and control façade need from a claimed
/// USB interface. Mirrors the subset of `rusb::DeviceHandle` this driver
/// actually touches.
pub trait UsbTransport {
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> TransportResult<usize>;
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> TransportResult<usize>;
    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> TransportResult<usize>;

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> TransportResult<usize>;
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> TransportResult<usize>;

    fn clear_halt(&self, endpoint: u8) -> TransportResult<()>;

    fn claim_interface(&self, interface_number: u8) -> TransportResult<()>;
    fn release_interface(&self, interface_number: u8) -> TransportResult<()>;
    fn set_active_configuration(&self, config_number: u8) -> TransportResult<()>;
    fn set_alternate_setting(&self, interface_number: u8, setting_number: u8) -> TransportResult<()>;
    fn kernel_driver_active(&self, interface_number: u8) -> TransportResult<bool>;
    fn detach_kernel_driver(&self, interface_number: u8) -> TransportResult<()>;
    fn attach_kernel_driver(&self, interface_number: u8) -> TransportResult<()>;
}

impl<T: rusb::UsbContext> UsbTransport for rusb::DeviceHandle<T> {
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> TransportResult<usize> {
        Ok(rusb::DeviceHandle::write_bulk(self, endpoint, data, timeout)?)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> TransportResult<usize> {
        Ok(rusb::DeviceHandle::read_bulk(self, endpoint, buf, timeout)?)
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> TransportResult<usize> {
        Ok(rusb::DeviceHandle::read_interrupt(self, endpoint, buf, timeout)?)
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> TransportResult<usize> {
        Ok(rusb::DeviceHandle::read_control(
            self,
            request_type,
            request,
            value,
            index,
            buf,
            timeout,
        )?)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> TransportResult<usize> {
        Ok(rusb::DeviceHandle::write_control(
            self,
            request_type,
            request,
            value,
            index,
            data,
            timeout,
        )?)
    }

    fn clear_halt(&self, endpoint: u8) -> TransportResult<()> {
        Ok(rusb::DeviceHandle::clear_halt(self, endpoint)?)
    }

    fn claim_interface(&self, interface_number: u8) -> TransportResult<()> {
        Ok(rusb::DeviceHandle::claim_interface(self, interface_number)?)
    }

    fn release_interface(&self, interface_number: u8) -> TransportResult<()> {
        Ok(rusb::DeviceHandle::release_interface(self, interface_number)?)
    }

    fn set_active_configuration(&self, config_number: u8) -> TransportResult<()> {
        Ok(rusb::DeviceHandle::set_active_configuration(self, config_number)?)
    }

    fn set_alternate_setting(&self, interface_number: u8, setting_number: u8) -> TransportResult<()> {
        Ok(rusb::DeviceHandle::set_alternate_setting(
            self,
            interface_number,
            setting_number,
        )?)
    }

    fn kernel_driver_active(&self, interface_number: u8) -> TransportResult<bool> {
        Ok(rusb::DeviceHandle::kernel_driver_active(self, interface_number)?)
    }

    fn detach_kernel_driver(&self, interface_number: u8) -> TransportResult<()> {
        Ok(rusb::DeviceHandle::detach_kernel_driver(self, interface_number)?)
    }

    fn attach_kernel_driver(&self, interface_number: u8) -> TransportResult<()> {
        Ok(rusb::DeviceHandle::attach_kernel_driver(self, interface_number)?)
    }
}

/// In-memory `UsbTransport` implementation used by this crate's own tests
/// and available to integration tests that want to drive the protocol
/// engine without real hardware.
pub mod mock;
