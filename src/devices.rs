//! ## Device discovery
//!
//! Out-of-scope in the protocol sense (§1: "consumed from a USB host
//! library") but still needed to turn a `(vid, pid, serial?)` or a
//! [`crate::resource::Resource`] into an opened `rusb` device handle. This
//! is a thin pass-through to `rusb::Context::devices()` plus the filtering
//! predicates a caller supplies.

use std::time::Duration;

use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, UsbContext};

use crate::descriptor::is_tmc_device;
use crate::error::Error;
use crate::types::{DeviceAddr, DeviceId, DeviceInfo};

/// Something that can accept or reject a candidate USB device.
pub trait DeviceFilter {
    fn apply_filter<T: UsbContext>(&self, device: &Device<T>, device_desc: &DeviceDescriptor) -> bool;
}

/// Accept the first USBTMC device found.
impl DeviceFilter for () {
    fn apply_filter<T: UsbContext>(&self, _device: &Device<T>, _device_desc: &DeviceDescriptor) -> bool {
        true
    }
}

impl DeviceFilter for DeviceAddr {
    fn apply_filter<T: UsbContext>(&self, device: &Device<T>, _device_desc: &DeviceDescriptor) -> bool {
        self.bus == device.bus_number() && self.device == device.address()
    }
}

impl DeviceFilter for (u8, u8) {
    fn apply_filter<T: UsbContext>(&self, device: &Device<T>, _device_desc: &DeviceDescriptor) -> bool {
        self.0 == device.bus_number() && self.1 == device.address()
    }
}

impl DeviceFilter for DeviceId {
    fn apply_filter<T: UsbContext>(&self, _device: &Device<T>, device_desc: &DeviceDescriptor) -> bool {
        self.vendor_id == device_desc.vendor_id() && self.product_id == device_desc.product_id()
    }
}

impl DeviceFilter for (u16, u16) {
    fn apply_filter<T: UsbContext>(&self, _device: &Device<T>, device_desc: &DeviceDescriptor) -> bool {
        self.0 == device_desc.vendor_id() && self.1 == device_desc.product_id()
    }
}

impl DeviceFilter for DeviceInfo {
    fn apply_filter<T: UsbContext>(&self, device: &Device<T>, device_desc: &DeviceDescriptor) -> bool {
        self.id.apply_filter(device, device_desc) && self.address.apply_filter(device, device_desc)
    }
}

impl<F: DeviceFilter> DeviceFilter for &F {
    fn apply_filter<T: UsbContext>(&self, device: &Device<T>, device_desc: &DeviceDescriptor) -> bool {
        (**self).apply_filter(device, device_desc)
    }
}

/// List every attached device exposing a USBTMC interface.
pub fn list_devices<T: UsbContext>(context: &mut T) -> Result<Vec<DeviceInfo>, Error> {
    Ok(context
        .devices()
        .map_err(Error::from)?
        .iter()
        .filter_map(|device| {
            let device_desc = device.device_descriptor().ok()?;
            is_tmc_device(&device).then(|| DeviceInfo {
                id: DeviceId {
                    vendor_id: device_desc.vendor_id(),
                    product_id: device_desc.product_id(),
                },
                address: DeviceAddr {
                    bus: device.bus_number(),
                    device: device.address(),
                },
            })
        })
        .collect())
}

/// Open the first USBTMC device matching `filter` (and, if given, `serial`).
///
/// Serial-number matching requires a control transfer against an opened
/// handle, so candidates are opened speculatively and closed again (by
/// dropping the handle) when their serial doesn't match.
pub fn open_device<T: UsbContext>(
    context: &mut T,
    filter: impl DeviceFilter,
    serial: Option<&str>,
) -> Result<(Device<T>, DeviceHandle<T>), Error> {
    let devices = context.devices().map_err(Error::from)?;

    for device in devices.iter() {
        let Ok(device_desc) = device.device_descriptor() else {
            continue;
        };
        if !is_tmc_device(&device) || !filter.apply_filter(&device, &device_desc) {
            continue;
        }
        let Ok(handle) = device.open() else {
            continue;
        };

        match serial {
            None => return Ok((device, handle)),
            Some(expected) => {
                if read_serial(&handle, &device_desc).as_deref() == Some(expected) {
                    return Ok((device, handle));
                }
            }
        }
    }

    Err(Error::DeviceNotFound)
}

fn read_serial<T: UsbContext>(handle: &DeviceHandle<T>, device_desc: &DeviceDescriptor) -> Option<String> {
    let language = handle
        .read_languages(Duration::from_millis(200))
        .ok()?
        .into_iter()
        .next()?;
    handle
        .read_serial_number_string(language, device_desc, Duration::from_millis(200))
        .ok()
}
