//! ## Descriptor resolver
//!
//! Finds the USBTMC interface on an opened device (component 2): a
//! `bInterfaceClass == 0xFE`, `bInterfaceSubClass == 0x03` interface alternate,
//! its bulk-OUT/bulk-IN endpoints, its optional interrupt-IN endpoint, and
//! whether `bInterfaceProtocol == 0x01` (USB488).
//!
//! The matching predicates are plain functions over descriptor fields so
//! they can be unit-tested without a live USB device; only the outer scan
//! over `rusb::Device` needs real hardware (or, in CI, to be skipped).

use crate::constants::usb::{USBTMC_CLASS_CODE, USBTMC_PROTOCOL_CODE, USBTMC_SUBCLASS_CODE};
use crate::error::Error;
use crate::types::{DeviceMode, Endpoint, UsbtmcEndpoints};

use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};

/// Whether an interface alternate's class/subclass mark it as USBTMC.
///
/// Deliberately does *not* require `bInterfaceProtocol == 0x01` — per spec,
/// USB488 is an optional refinement a pure USBTMC device may not implement.
pub fn interface_matches(class_code: u8, sub_class_code: u8) -> bool {
    class_code == USBTMC_CLASS_CODE && sub_class_code == USBTMC_SUBCLASS_CODE
}

/// Whether an interface alternate advertises the USB488 subclass protocol.
pub fn is_usb488(protocol_code: u8) -> bool {
    protocol_code == USBTMC_PROTOCOL_CODE
}

/// Pick the bulk-OUT, bulk-IN and (if present) interrupt-IN endpoints out of
/// a flat endpoint list for one interface alternate.
pub fn select_endpoints(endpoints: &[Endpoint]) -> Result<UsbtmcEndpoints, Error> {
    let bulk_out_ep = endpoints
        .iter()
        .find(|ep| ep.transfer_type == TransferType::Bulk && ep.direction == Direction::Out)
        .cloned()
        .ok_or(Error::BulkOutEndpointNotFound)?;
    let bulk_in_ep = endpoints
        .iter()
        .find(|ep| ep.transfer_type == TransferType::Bulk && ep.direction == Direction::In)
        .cloned()
        .ok_or(Error::BulkInEndpointNotFound)?;
    let interrupt_ep = endpoints
        .iter()
        .find(|ep| ep.transfer_type == TransferType::Interrupt && ep.direction == Direction::In)
        .cloned();

    Ok(UsbtmcEndpoints {
        bulk_out_ep,
        bulk_in_ep,
        interrupt_ep,
    })
}

pub(crate) fn is_tmc_device<T: UsbContext>(device: &Device<T>) -> bool {
    (0..device.device_descriptor().map(|d| d.num_configurations()).unwrap_or(0)).any(|config_no| {
        device
            .config_descriptor(config_no)
            .map(|config_desc| {
                config_desc.interfaces().any(|interface| {
                    interface
                        .descriptors()
                        .any(|d| interface_matches(d.class_code(), d.sub_class_code()))
                })
            })
            .unwrap_or(false)
    })
}

/// Scan a device's configurations for the first USBTMC interface alternate.
pub fn get_usbtmc_mode(device: &Device<Context>) -> Result<DeviceMode, Error> {
    let device_desc = device.device_descriptor().map_err(Error::from)?;

    for n in 0..device_desc.num_configurations() {
        let config_desc = device.config_descriptor(n).map_err(Error::from)?;
        for interface in config_desc.interfaces() {
            for interface_desc in interface.descriptors() {
                if interface_matches(interface_desc.class_code(), interface_desc.sub_class_code()) {
                    return Ok(DeviceMode {
                        config_number: config_desc.number(),
                        interface_number: interface_desc.interface_number(),
                        setting_number: interface_desc.setting_number(),
                        usb488: is_usb488(interface_desc.protocol_code()),
                        has_kernel_driver: false,
                    });
                }
            }
        }
    }

    Err(Error::DeviceIncompatible)
}

/// Detach the kernel driver from `mode.interface_number` if one is active,
/// recording the fact so the caller can reattach it on close.
pub fn detach_kernel_driver(
    mode: &mut DeviceMode,
    handle: &mut DeviceHandle<Context>,
) -> Result<(), Error> {
    mode.has_kernel_driver = match handle.kernel_driver_active(mode.interface_number) {
        Ok(true) => {
            handle
                .detach_kernel_driver(mode.interface_number)
                .map_err(Error::from)?;
            true
        }
        _ => false,
    };
    Ok(())
}

/// Resolve the bulk/interrupt endpoints of the alternate described by `mode`.
pub fn get_endpoints(mode: &DeviceMode, device: &Device<Context>) -> Result<UsbtmcEndpoints, Error> {
    let config_desc = device
        .config_descriptor(mode.config_number - 1)
        .map_err(Error::from)?;
    let interface = config_desc
        .interfaces()
        .find(|inter| inter.number() == mode.interface_number)
        .ok_or(Error::InterfaceNotFound)?;
    let interface_desc = interface
        .descriptors()
        .find(|d| d.setting_number() == mode.setting_number)
        .ok_or(Error::InterfaceSettingNotFound)?;

    let endpoints: Vec<Endpoint> = interface_desc
        .endpoint_descriptors()
        .map(|ep| Endpoint {
            address: ep.address(),
            max_packet_size: ep.max_packet_size(),
            transfer_type: ep.transfer_type(),
            direction: ep.direction(),
        })
        .collect();

    select_endpoints(&endpoints)
}
