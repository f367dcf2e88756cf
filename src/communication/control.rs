//! ## Control request façade
//!
//! Every USBTMC/USB488 class-specific control request (§4.5, §4.6): device
//! capabilities, the bulk-out/bulk-in abort state machines, the device-level
//! clear state machine, endpoint halt clearing, and the USB488 remote/local/
//! status-byte requests. Bounded by `MAX_STATUS_POLL_ITERATIONS` so a
//! misbehaving device can't wedge a caller in an infinite poll loop.

use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use rusb::{Direction, Recipient, RequestType};

use crate::constants::{control_requests, misc, usbtmc_status};
use crate::error::Error;
use crate::types::{Capabilities, Endpoint, Handle, Timeout};

fn interface_request_type(direction: Direction) -> u8 {
    rusb::request_type(direction, RequestType::Class, Recipient::Interface)
}

fn endpoint_request_type(direction: Direction) -> u8 {
    rusb::request_type(direction, RequestType::Class, Recipient::Endpoint)
}

/// `GET_CAPABILITIES` (§4.5.1): device/interface capability bits plus the
/// advertised USBTMC version.
pub fn get_capabilities(handle: &Handle, interface_number: u8, timeout: &Timeout) -> Result<Capabilities, Error> {
    let mut buffer = [0u8; 0x18];

    handle.borrow().read_control(
        interface_request_type(Direction::In),
        control_requests::GET_CAPABILITIES,
        0x0000,
        interface_number as u16,
        &mut buffer,
        timeout.get(),
    )?;

    match buffer[0] {
        usbtmc_status::STATUS_SUCCESS => {}
        _ => return Err(Error::StatusUnexpectedFailure),
    }

    let bcd_version = u16::from_le_bytes([buffer[2], buffer[3]]);
    let interface_capabilities = buffer[4];
    let device_capabilities = buffer[5];

    Ok(Capabilities {
        bcd_version,
        accepts_indicator_pulse_request: interface_capabilities & 0b0000_0100 != 0,
        is_talk_only: interface_capabilities & 0b0000_0010 != 0,
        is_listen_only: interface_capabilities & 0b0000_0001 != 0,
        supports_bulk_in_term_char: device_capabilities & 0b0000_0001 != 0,
    })
}

/// `INDICATOR_PULSE` (§4.5.2): ask the device to flash its activity indicator.
/// Only meaningful when `Capabilities::accepts_indicator_pulse_request` is set.
pub fn indicator_pulse(handle: &Handle, interface_number: u8, timeout: &Timeout) -> Result<(), Error> {
    let mut buffer = [0u8; 1];

    handle.borrow().read_control(
        interface_request_type(Direction::In),
        control_requests::INDICATOR_PULSE,
        0x0000,
        interface_number as u16,
        &mut buffer,
        timeout.get(),
    )?;

    match buffer[0] {
        usbtmc_status::STATUS_SUCCESS => Ok(()),
        usbtmc_status::STATUS_FAILED => Err(Error::StatusFailure),
        _ => Err(Error::StatusUnexpectedFailure),
    }
}

/// `INITIATE_ABORT_BULK_OUT` + bounded `CHECK_ABORT_BULK_OUT_STATUS` polling
/// (§4.6.1). Returns the number of bytes the device had already accepted
/// before the abort took effect.
pub fn abort_bulk_out(handle: &Handle, bulk_out_ep: &Endpoint, btag: u8, timeout: &Timeout) -> Result<usize, Error> {
    debug!("aborting bulk-out transfer bTag={btag}");

    let w_value = btag as u16;
    let w_index = bulk_out_ep.address as u16;

    let mut initiate = [0u8; 2];
    handle.borrow().read_control(
        endpoint_request_type(Direction::In),
        control_requests::INITIATE_ABORT_BULK_OUT,
        w_value,
        w_index,
        &mut initiate,
        timeout.get(),
    )?;

    match initiate[0] {
        usbtmc_status::STATUS_SUCCESS => {}
        usbtmc_status::STATUS_FAILED => return Err(Error::AbortFailed),
        usbtmc_status::STATUS_TRANSFER_NOT_IN_PROGRESS => return Err(Error::StatusNoTransferInProgress),
        _ => return Err(Error::StatusUnexpectedFailure),
    }

    let bytes_accepted = poll_abort_status(handle, control_requests::CHECK_ABORT_BULK_OUT_STATUS, w_index, timeout)?;
    handle.borrow().clear_halt(bulk_out_ep.address)?;
    Ok(bytes_accepted)
}

/// `INITIATE_ABORT_BULK_IN` + bounded `CHECK_ABORT_BULK_IN_STATUS` polling
/// (§4.6.2). Returns the number of bytes the device had already transferred
/// before the abort took effect.
///
/// Unlike the bulk-out abort, the bulk-in status reply's `bmAbortBulkIn`
/// bit0 tells the host whether the device still has queued data it wants
/// read off the endpoint before the abort can resolve; this loop drains a
/// scratch read whenever that bit is set, per §4.6.2, rather than treating
/// the poll as a bare status check.
pub fn abort_bulk_in(handle: &Handle, bulk_in_ep: &Endpoint, btag: u8, timeout: &Timeout) -> Result<usize, Error> {
    debug!("aborting bulk-in transfer bTag={btag}");

    let w_value = btag as u16;
    let w_index = bulk_in_ep.address as u16;

    let mut initiate = [0u8; 2];
    handle.borrow().read_control(
        endpoint_request_type(Direction::In),
        control_requests::INITIATE_ABORT_BULK_IN,
        w_value,
        w_index,
        &mut initiate,
        timeout.get(),
    )?;

    match initiate[0] {
        usbtmc_status::STATUS_SUCCESS => {}
        usbtmc_status::STATUS_FAILED => return Err(Error::AbortFailed),
        usbtmc_status::STATUS_TRANSFER_NOT_IN_PROGRESS => return Err(Error::StatusNoTransferInProgress),
        _ => return Err(Error::StatusUnexpectedFailure),
    }

    let mut buffer = [0u8; 8];
    let mut scratch = [0u8; 4096];

    for attempt in 0..misc::MAX_STATUS_POLL_ITERATIONS {
        handle.borrow().read_control(
            endpoint_request_type(Direction::In),
            control_requests::CHECK_ABORT_BULK_IN_STATUS,
            0x0000,
            w_index,
            &mut buffer,
            timeout.get(),
        )?;

        let bytes_transferred = u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;

        match buffer[0] {
            usbtmc_status::STATUS_PENDING => {
                if buffer[1] & 0b0000_0001 != 0 {
                    trace!("bulk-in abort pending, device wants more drained, attempt {attempt}");
                    let _ = handle.borrow().read_bulk(bulk_in_ep.address, &mut scratch, misc::DRAIN_TIMEOUT);
                } else {
                    trace!("bulk-in abort pending, attempt {attempt}");
                    thread::sleep(misc::STATUS_POLL_BACKOFF);
                }
                continue;
            }
            usbtmc_status::STATUS_SUCCESS => {
                handle.borrow().clear_halt(bulk_in_ep.address)?;
                return Ok(bytes_transferred);
            }
            _ => return Err(Error::StatusUnexpectedFailure),
        }
    }

    warn!("bulk-in abort did not resolve within {} polls", misc::MAX_STATUS_POLL_ITERATIONS);
    Err(Error::AbortTimeout)
}

fn poll_abort_status(handle: &Handle, check_request: u8, w_index: u16, timeout: &Timeout) -> Result<usize, Error> {
    let mut buffer = [0u8; 8];

    for attempt in 0..misc::MAX_STATUS_POLL_ITERATIONS {
        handle
            .borrow()
            .read_control(endpoint_request_type(Direction::In), check_request, 0x0000, w_index, &mut buffer, timeout.get())?;

        match buffer[0] {
            usbtmc_status::STATUS_PENDING => {
                trace!("abort status pending, attempt {attempt}");
                thread::sleep(misc::STATUS_POLL_BACKOFF);
                continue;
            }
            usbtmc_status::STATUS_SUCCESS => {
                return Ok(u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize);
            }
            _ => return Err(Error::StatusUnexpectedFailure),
        }
    }

    warn!("abort did not resolve within {} polls", misc::MAX_STATUS_POLL_ITERATIONS);
    Err(Error::AbortTimeout)
}

/// `INITIATE_CLEAR` + bounded `CHECK_CLEAR_STATUS` polling (§4.6.3): resets
/// the device's USBTMC interface state. When a poll's `bmClear` bit0 says
/// the device still has bulk-IN data queued, drains it before re-polling;
/// on success, clears the bulk-OUT halt the same way a bulk-out abort would.
pub fn clear(handle: &Handle, interface_number: u8, bulk_out_ep: &Endpoint, bulk_in_ep: &Endpoint, timeout: &Timeout) -> Result<(), Error> {
    debug!("clearing interface {interface_number}");

    let w_index = interface_number as u16;

    let mut initiate = [0u8; 1];
    handle.borrow().read_control(
        interface_request_type(Direction::In),
        control_requests::INITIATE_CLEAR,
        0x0000,
        w_index,
        &mut initiate,
        timeout.get(),
    )?;

    match initiate[0] {
        usbtmc_status::STATUS_SUCCESS => {}
        _ => return Err(Error::ClearFailed),
    }

    let mut buffer = [0u8; 2];
    let mut scratch = [0u8; 4096];

    for attempt in 0..misc::MAX_STATUS_POLL_ITERATIONS {
        handle.borrow().read_control(
            interface_request_type(Direction::In),
            control_requests::CHECK_CLEAR_STATUS,
            0x0000,
            w_index,
            &mut buffer,
            timeout.get(),
        )?;

        match buffer[0] {
            usbtmc_status::STATUS_PENDING => {
                if buffer[1] & 0b0000_0001 != 0 {
                    trace!("clear pending, device wants bulk-in drained, attempt {attempt}");
                    let _ = handle.borrow().read_bulk(bulk_in_ep.address, &mut scratch, misc::DRAIN_TIMEOUT);
                } else {
                    trace!("clear status pending, attempt {attempt}");
                    thread::sleep(misc::STATUS_POLL_BACKOFF);
                }
                continue;
            }
            usbtmc_status::STATUS_SUCCESS => {
                handle.borrow().clear_halt(bulk_out_ep.address)?;
                return Ok(());
            }
            _ => return Err(Error::ClearFailed),
        }
    }

    warn!("clear did not resolve within {} polls", misc::MAX_STATUS_POLL_ITERATIONS);
    Err(Error::ClearTimeout)
}

/// Clear a halt condition on one endpoint (not itself a USBTMC class
/// request, but part of the recovery sequence every abort/clear ends with).
pub fn clear_feature(handle: &Handle, endpoint: &Endpoint) -> Result<(), Error> {
    handle.borrow().clear_halt(endpoint.address)?;
    Ok(())
}

/// USB488 `READ_STATUS_BYTE` (§4.7): poll the device's IEEE-488 status byte
/// over the control endpoint. `tag` is the bTag-like correlation value the
/// USB488 subclass uses to match this request to its interrupt-IN
/// notification, allocated from a dedicated `[1, 127]` range.
pub fn read_status_byte(handle: &Handle, interface_number: u8, tag: u8, timeout: &Timeout) -> Result<u8, Error> {
    let mut buffer = [0u8; 3];

    handle.borrow().read_control(
        interface_request_type(Direction::In),
        control_requests::READ_STATUS_BYTE,
        tag as u16,
        interface_number as u16,
        &mut buffer,
        timeout.get(),
    )?;

    match buffer[0] {
        usbtmc_status::STATUS_SUCCESS => Ok(buffer[2]),
        usbtmc_status::STATUS_FAILED => Err(Error::StatusFailure),
        _ => Err(Error::StatusUnexpectedFailure),
    }
}

fn usb488_request(handle: &Handle, interface_number: u8, request: u8, timeout: &Timeout) -> Result<(), Error> {
    let mut buffer = [0u8; 1];

    handle.borrow().read_control(
        interface_request_type(Direction::In),
        request,
        0x0000,
        interface_number as u16,
        &mut buffer,
        timeout.get(),
    )?;

    match buffer[0] {
        usbtmc_status::STATUS_SUCCESS => Ok(()),
        usbtmc_status::STATUS_FAILED => Err(Error::StatusFailure),
        _ => Err(Error::StatusUnexpectedFailure),
    }
}

/// USB488 `REN_CONTROL`: assert or release remote-enable. Requires the
/// device's USB488 subclass support.
pub fn ren_control(handle: &Handle, interface_number: u8, enable: bool, timeout: &Timeout) -> Result<(), Error> {
    let mut buffer = [0u8; 1];
    handle.borrow().read_control(
        interface_request_type(Direction::In),
        control_requests::REN_CONTROL,
        enable as u16,
        interface_number as u16,
        &mut buffer,
        timeout.get(),
    )?;

    match buffer[0] {
        usbtmc_status::STATUS_SUCCESS => Ok(()),
        usbtmc_status::STATUS_FAILED => Err(Error::StatusFailure),
        _ => Err(Error::StatusUnexpectedFailure),
    }
}

/// USB488 `GO_TO_LOCAL`: drop the device out of remote mode (unless locked
/// out via `LOCAL_LOCKOUT`).
pub fn go_to_local(handle: &Handle, interface_number: u8, timeout: &Timeout) -> Result<(), Error> {
    usb488_request(handle, interface_number, control_requests::GO_TO_LOCAL, timeout)
}

/// USB488 `LOCAL_LOCKOUT`: disable the device's front-panel return-to-local.
pub fn local_lockout(handle: &Handle, interface_number: u8, timeout: &Timeout) -> Result<(), Error> {
    usb488_request(handle, interface_number, control_requests::LOCAL_LOCKOUT, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use rusb::TransferType;
    use std::sync::Arc;

    fn bulk_out_endpoint() -> Endpoint {
        Endpoint {
            address: 0x02,
            max_packet_size: 64,
            transfer_type: TransferType::Bulk,
            direction: Direction::Out,
        }
    }

    #[test]
    fn get_capabilities_decodes_bits() {
        let mock = Arc::new(MockTransport::new());
        let mut reply = vec![0u8; 0x18];
        reply[0] = usbtmc_status::STATUS_SUCCESS;
        reply[2..4].copy_from_slice(&0x0100u16.to_le_bytes());
        reply[4] = 0b0000_0111; // all interface capability bits set
        reply[5] = 0b0000_0001; // term char support
        mock.queue_control_in(control_requests::GET_CAPABILITIES, reply);

        let handle = Handle::new(mock);
        let timeout = Timeout::new(Duration::from_millis(100));
        let caps = get_capabilities(&handle, 0, &timeout).unwrap();

        assert_eq!(caps.bcd_version, 0x0100);
        assert!(caps.accepts_indicator_pulse_request);
        assert!(caps.is_talk_only);
        assert!(caps.is_listen_only);
        assert!(caps.supports_bulk_in_term_char);
    }

    #[test]
    fn abort_bulk_out_polls_past_pending_then_clears_halt() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_control_in(control_requests::INITIATE_ABORT_BULK_OUT, vec![usbtmc_status::STATUS_SUCCESS, 0]);
        mock.queue_control_in(
            control_requests::CHECK_ABORT_BULK_OUT_STATUS,
            vec![usbtmc_status::STATUS_PENDING, 0, 0, 0, 0, 0, 0, 0],
        );
        mock.queue_control_in(
            control_requests::CHECK_ABORT_BULK_OUT_STATUS,
            vec![usbtmc_status::STATUS_SUCCESS, 0, 0, 0, 12, 0, 0, 0],
        );

        let endpoint = bulk_out_endpoint();
        let handle = Handle::new(mock.clone());
        let timeout = Timeout::new(Duration::from_millis(100));

        let accepted = abort_bulk_out(&handle, &endpoint, 7, &timeout).unwrap();
        assert_eq!(accepted, 12);
        assert!(mock.was_halt_cleared(endpoint.address));
    }

    #[test]
    fn abort_bulk_out_reports_transfer_not_in_progress() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_control_in(
            control_requests::INITIATE_ABORT_BULK_OUT,
            vec![usbtmc_status::STATUS_TRANSFER_NOT_IN_PROGRESS, 0],
        );

        let endpoint = bulk_out_endpoint();
        let handle = Handle::new(mock);
        let timeout = Timeout::new(Duration::from_millis(100));

        let err = abort_bulk_out(&handle, &endpoint, 3, &timeout).unwrap_err();
        assert!(matches!(err, Error::StatusNoTransferInProgress));
    }

    fn bulk_in_endpoint() -> Endpoint {
        Endpoint {
            address: 0x82,
            max_packet_size: 64,
            transfer_type: TransferType::Bulk,
            direction: Direction::In,
        }
    }

    #[test]
    fn clear_runs_initiate_then_polls_to_success() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_control_in(control_requests::INITIATE_CLEAR, vec![usbtmc_status::STATUS_SUCCESS]);
        mock.queue_control_in(control_requests::CHECK_CLEAR_STATUS, vec![usbtmc_status::STATUS_PENDING, 0]);
        mock.queue_control_in(control_requests::CHECK_CLEAR_STATUS, vec![usbtmc_status::STATUS_SUCCESS, 0]);

        let out_ep = bulk_out_endpoint();
        let in_ep = bulk_in_endpoint();
        let handle = Handle::new(mock.clone());
        let timeout = Timeout::new(Duration::from_millis(100));
        clear(&handle, 0, &out_ep, &in_ep, &timeout).unwrap();
        assert!(mock.was_halt_cleared(out_ep.address));
    }

    #[test]
    fn clear_drains_bulk_in_when_bm_clear_bit_set() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_control_in(control_requests::INITIATE_CLEAR, vec![usbtmc_status::STATUS_SUCCESS]);
        mock.queue_control_in(control_requests::CHECK_CLEAR_STATUS, vec![usbtmc_status::STATUS_PENDING, 0b0000_0001]);
        mock.queue_bulk_in(0x82, vec![b'x'; 4]);
        mock.queue_control_in(control_requests::CHECK_CLEAR_STATUS, vec![usbtmc_status::STATUS_SUCCESS, 0]);

        let out_ep = bulk_out_endpoint();
        let in_ep = bulk_in_endpoint();
        let handle = Handle::new(mock.clone());
        let timeout = Timeout::new(Duration::from_millis(100));
        clear(&handle, 0, &out_ep, &in_ep, &timeout).unwrap();
        assert_eq!(mock.pending_bulk_in(in_ep.address), 0);
    }

    #[test]
    fn clear_reports_clear_failed_on_bad_initiate_status() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_control_in(control_requests::INITIATE_CLEAR, vec![usbtmc_status::STATUS_FAILED]);

        let out_ep = bulk_out_endpoint();
        let in_ep = bulk_in_endpoint();
        let handle = Handle::new(mock);
        let timeout = Timeout::new(Duration::from_millis(100));
        let err = clear(&handle, 0, &out_ep, &in_ep, &timeout).unwrap_err();
        assert!(matches!(err, Error::ClearFailed));
    }

    #[test]
    fn read_status_byte_returns_the_byte_on_success() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_control_in(control_requests::READ_STATUS_BYTE, vec![usbtmc_status::STATUS_SUCCESS, 0, 0x44]);

        let handle = Handle::new(mock);
        let timeout = Timeout::new(Duration::from_millis(100));
        let stb = read_status_byte(&handle, 0, 5, &timeout).unwrap();
        assert_eq!(stb, 0x44);
    }

    #[test]
    fn go_to_local_propagates_status_failure() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_control_in(control_requests::GO_TO_LOCAL, vec![usbtmc_status::STATUS_FAILED]);

        let handle = Handle::new(mock);
        let timeout = Timeout::new(Duration::from_millis(100));
        let err = go_to_local(&handle, 0, &timeout).unwrap_err();
        assert!(matches!(err, Error::StatusFailure));
    }

    #[test]
    fn abort_exhausting_poll_budget_times_out() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_control_in(control_requests::INITIATE_ABORT_BULK_IN, vec![usbtmc_status::STATUS_SUCCESS, 0]);
        for _ in 0..misc::MAX_STATUS_POLL_ITERATIONS {
            mock.queue_control_in(
                control_requests::CHECK_ABORT_BULK_IN_STATUS,
                vec![usbtmc_status::STATUS_PENDING, 0, 0, 0, 0, 0, 0, 0],
            );
        }

        let endpoint = Endpoint {
            address: 0x82,
            max_packet_size: 64,
            transfer_type: TransferType::Bulk,
            direction: Direction::In,
        };
        let handle = Handle::new(mock);
        let timeout = Timeout::new(Duration::from_millis(100));

        let err = abort_bulk_in(&handle, &endpoint, 2, &timeout).unwrap_err();
        assert!(matches!(err, Error::AbortTimeout));
    }
}
