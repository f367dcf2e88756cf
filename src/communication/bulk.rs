//! ## Bulk protocol engine
//!
//! The write-message, request-in and read-response state machines (§4.3,
//! §4.4): fragmenting an outgoing payload into `DEV_DEP_MSG_OUT` packets,
//! requesting and reassembling a `DEV_DEP_MSG_IN` reply, and handing off to
//! the control façade's abort state machines (§4.6) on timeout or a tag
//! mismatch.

use log::{debug, trace, warn};

use crate::constants::{bulk_msg_id, misc};
use crate::error::Error;
use crate::header::{self, DecodeMode};
use crate::tag::TagAllocator;
use crate::types::{Endpoint, Handle, Timeout};

use super::control;

use rusb::{Direction, TransferType};

fn check_bulk_out_endpoint(ep: &Endpoint) -> Result<(), Error> {
    if ep.direction != Direction::Out || ep.transfer_type != TransferType::Bulk {
        return Err(Error::IncorrectEndpoint);
    }
    Ok(())
}

fn check_bulk_in_endpoint(ep: &Endpoint) -> Result<(), Error> {
    if ep.direction != Direction::In || ep.transfer_type != TransferType::Bulk {
        return Err(Error::IncorrectEndpoint);
    }
    Ok(())
}

/// Write `data` to the bulk-OUT endpoint as one or more `DEV_DEP_MSG_OUT`
/// messages, fragmenting on `max_transfer_size` and marking EOM only on the
/// final fragment.
pub fn write(
    handle: &Handle,
    tags: &TagAllocator,
    data: &[u8],
    bulk_out_ep: &Endpoint,
    max_transfer_size: u32,
    timeout: &Timeout,
) -> Result<(), Error> {
    check_bulk_out_endpoint(bulk_out_ep)?;

    let chunk_size = (max_transfer_size as usize).max(1);
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![&[][..]]
    } else {
        data.chunks(chunk_size).collect()
    };
    let last = chunks.len() - 1;

    for (i, chunk) in chunks.iter().enumerate() {
        let btag = tags.next();
        let eom = i == last;
        let header = header::encode_out(bulk_msg_id::DEVICE_DEPENDENT_MSG_OUT, btag, chunk.len() as u32, eom);

        let mut wire = Vec::with_capacity(header.len() + chunk.len() + 3);
        wire.extend_from_slice(&header);
        wire.extend_from_slice(chunk);
        header::pad_to_alignment(&mut wire);

        trace!("bulk-out bTag={btag} payload_len={} eom={eom}", chunk.len());

        let written = handle.borrow().write_bulk(bulk_out_ep.address, &wire, timeout.get());

        match written {
            Ok(n) if n == wire.len() => {}
            Ok(n) => {
                warn!("short bulk-out transfer ({n}/{} bytes), aborting bTag={btag}", wire.len());
                let _ = control::abort_bulk_out(handle, bulk_out_ep, btag, timeout);
                return Err(Error::IoError(format!("wrote {n} of {} bytes", wire.len())));
            }
            Err(Error::Timeout) => {
                warn!("bulk-out timeout, aborting bTag={btag}");
                control::abort_bulk_out(handle, bulk_out_ep, btag, timeout)?;
                return Err(Error::Timeout);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Send the USB488 `TRIGGER` bulk message (MsgID 128): a bare header with no
/// payload, same tag discipline as a `DEV_DEP_MSG_OUT`.
pub fn trigger(handle: &Handle, tags: &TagAllocator, bulk_out_ep: &Endpoint, timeout: &Timeout) -> Result<(), Error> {
    check_bulk_out_endpoint(bulk_out_ep)?;

    let btag = tags.next();
    let mut wire = header::encode_out(bulk_msg_id::TRIGGER, btag, 0, true).to_vec();
    header::pad_to_alignment(&mut wire);

    trace!("bulk-out TRIGGER bTag={btag}");

    let written = handle.borrow().write_bulk(bulk_out_ep.address, &wire, timeout.get())?;
    if written != wire.len() {
        let _ = control::abort_bulk_out(handle, bulk_out_ep, btag, timeout);
        return Err(Error::IoError(format!("wrote {written} of {} bytes", wire.len())));
    }
    Ok(())
}

/// Request and reassemble a response of at most `max_len` bytes.
///
/// When `advantest_quirk` is set, the `REQUEST_DEV_DEP_MSG_IN` header is
/// skipped and the bulk-IN endpoint is read directly (the device is assumed
/// to already have a reply queued).
#[allow(clippy::too_many_arguments)]
pub fn read(
    handle: &Handle,
    tags: &TagAllocator,
    bulk_in_ep: &Endpoint,
    bulk_out_ep: &Endpoint,
    max_transfer_size: u32,
    max_len: usize,
    term_char: Option<u8>,
    advantest_quirk: bool,
    timeout: &Timeout,
) -> Result<Vec<u8>, Error> {
    check_bulk_out_endpoint(bulk_out_ep)?;
    check_bulk_in_endpoint(bulk_in_ep)?;

    let btag = tags.next();

    if !advantest_quirk {
        let request = header::encode_in_request(
            bulk_msg_id::REQUEST_DEVICE_DEPENDENT_MSG_IN,
            btag,
            max_transfer_size,
            term_char,
        );

        trace!("bulk-out REQUEST_DEV_DEP_MSG_IN bTag={btag} max={max_transfer_size}");

        match handle.borrow().write_bulk(bulk_out_ep.address, &request, timeout.get()) {
            Ok(_) => {}
            Err(Error::Timeout) => {
                warn!("request-in timeout, aborting bTag={btag}");
                control::abort_bulk_out(handle, bulk_out_ep, btag, timeout)?;
                return Err(Error::Timeout);
            }
            Err(e) => return Err(e),
        }
    }

    let mut accum: Vec<u8> = Vec::new();
    let mut eom = false;
    let mut buffer = vec![0u8; misc::USBTMC_HEADER_SIZE + max_transfer_size as usize + 3];

    while !eom && accum.len() < max_len {
        let n = match handle.borrow().read_bulk(bulk_in_ep.address, &mut buffer, timeout.get()) {
            Ok(n) => n,
            Err(Error::Timeout) => {
                warn!("bulk-in timeout, aborting bTag={btag}");
                control::abort_bulk_in(handle, bulk_in_ep, btag, timeout)?;
                return Err(Error::Timeout);
            }
            Err(e) => return Err(e),
        };

        let decoded = header::decode(&buffer[..n.min(buffer.len())], DecodeMode::Lenient);
        let fragment = match decoded {
            Ok(h) if h.msg_id == bulk_msg_id::DEVICE_DEPENDENT_MSG_IN && h.btag == btag => h,
            _ => {
                warn!("protocol mismatch on bulk-in, aborting bTag={btag}");
                control::abort_bulk_in(handle, bulk_in_ep, btag, timeout)?;
                return Err(Error::ProtocolMismatch);
            }
        };

        let payload_start = misc::USBTMC_HEADER_SIZE;
        let available = n.saturating_sub(payload_start);
        let take = (fragment.transfer_size as usize).min(available);
        accum.extend_from_slice(&buffer[payload_start..payload_start + take]);
        eom = fragment.eom;

        trace!("bulk-in bTag={btag} fragment_len={take} eom={eom}");
    }

    let truncated = accum.len() > max_len;
    accum.truncate(max_len);

    if truncated || (accum.len() == max_len && !eom) {
        debug!("read hit max_len before consuming the full reply; draining remainder via bulk-in abort, bTag={btag}");
        control::abort_bulk_in(handle, bulk_in_ep, btag, timeout)?;
    }

    Ok(accum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{control_requests, usbtmc_status};
    use crate::transport::mock::MockTransport;
    use std::sync::Arc;
    use std::time::Duration;

    fn endpoints() -> (Endpoint, Endpoint) {
        let out = Endpoint {
            address: 0x02,
            max_packet_size: 64,
            transfer_type: TransferType::Bulk,
            direction: Direction::Out,
        };
        let inp = Endpoint {
            address: 0x82,
            max_packet_size: 64,
            transfer_type: TransferType::Bulk,
            direction: Direction::In,
        };
        (out, inp)
    }

    #[test]
    fn write_single_chunk_emits_aligned_eom_header() {
        let (out_ep, _) = endpoints();
        let mock = Arc::new(MockTransport::new());
        let handle = Handle::new(mock.clone());
        let tags = TagAllocator::new();
        let timeout = Timeout::new(Duration::from_millis(100));

        write(&handle, &tags, b"*IDN?\n", &out_ep, 1_048_576, &timeout).unwrap();

        let log = mock.bulk_out_log();
        assert_eq!(log.len(), 1);
        let (address, wire) = &log[0];
        assert_eq!(*address, out_ep.address);
        assert_eq!(wire.len() % 4, 0);
        assert_eq!(wire[0], bulk_msg_id::DEVICE_DEPENDENT_MSG_OUT);
        assert_eq!(wire[1], 1);
        assert_eq!(wire[2], !1u8);
        assert_eq!(wire[8], 0b0000_0001); // EOM set on the only fragment
        assert_eq!(&wire[12..18], b"*IDN?\n");
    }

    #[test]
    fn write_then_read_round_trips_through_mock() {
        let (out_ep, in_ep) = endpoints();
        let mock = Arc::new(MockTransport::new());

        let mut reply = header::encode_out(bulk_msg_id::DEVICE_DEPENDENT_MSG_IN, 2, 38, true).to_vec();
        reply.extend_from_slice(b"AGILENT TECHNOLOGIES,MSO7104A,MY,06.16");
        header::pad_to_alignment(&mut reply);
        mock.queue_bulk_in(in_ep.address, reply);

        let handle = Handle::new(mock.clone());
        let tags = TagAllocator::new();
        let timeout = Timeout::new(Duration::from_millis(100));

        write(&handle, &tags, b"*IDN?", &out_ep, 1_048_576, &timeout).unwrap();
        let response = read(&handle, &tags, &in_ep, &out_ep, 1_048_576, usize::MAX, None, false, &timeout).unwrap();

        assert_eq!(response, b"AGILENT TECHNOLOGIES,MSO7104A,MY,06.16");

        let out_log = mock.bulk_out_log();
        assert_eq!(out_log.len(), 2);
        assert_eq!(out_log[0].1[0], bulk_msg_id::DEVICE_DEPENDENT_MSG_OUT);
        assert_eq!(out_log[0].1[1], 1); // first bTag allocated
        assert_eq!(out_log[1].1[0], bulk_msg_id::REQUEST_DEVICE_DEPENDENT_MSG_IN);
        assert_eq!(out_log[1].1[1], 2); // second bTag allocated
    }

    #[test]
    fn fragmented_read_reassembles_across_two_packets() {
        let (out_ep, in_ep) = endpoints();
        let mock = Arc::new(MockTransport::new());

        let mut first = header::encode_out(bulk_msg_id::DEVICE_DEPENDENT_MSG_IN, 1, 16, false).to_vec();
        first.extend_from_slice(&[b'a'; 16]);
        header::pad_to_alignment(&mut first);
        mock.queue_bulk_in(in_ep.address, first);

        let mut second = header::encode_out(bulk_msg_id::DEVICE_DEPENDENT_MSG_IN, 1, 7, true).to_vec();
        second.extend_from_slice(&[b'b'; 7]);
        header::pad_to_alignment(&mut second);
        mock.queue_bulk_in(in_ep.address, second);

        let handle = Handle::new(mock.clone());
        let tags = TagAllocator::new();
        let timeout = Timeout::new(Duration::from_millis(100));

        let response = read(&handle, &tags, &in_ep, &out_ep, 1_048_576, usize::MAX, None, false, &timeout).unwrap();
        assert_eq!(response.len(), 23);
        assert_eq!(&response[..16], &[b'a'; 16]);
        assert_eq!(&response[16..], &[b'b'; 7]);
    }

    #[test]
    fn truncated_read_aborts_bulk_in() {
        let (out_ep, in_ep) = endpoints();
        let mock = Arc::new(MockTransport::new());

        let mut fragment = header::encode_out(bulk_msg_id::DEVICE_DEPENDENT_MSG_IN, 1, 20, true).to_vec();
        fragment.extend_from_slice(&[b'x'; 20]);
        header::pad_to_alignment(&mut fragment);
        mock.queue_bulk_in(in_ep.address, fragment);

        mock.queue_control_in(control_requests::INITIATE_ABORT_BULK_IN, vec![usbtmc_status::STATUS_SUCCESS, 0]);
        mock.queue_control_in(
            control_requests::CHECK_ABORT_BULK_IN_STATUS,
            vec![usbtmc_status::STATUS_SUCCESS, 0, 0, 0, 0, 0, 0, 0],
        );

        let handle = Handle::new(mock.clone());
        let tags = TagAllocator::new();
        let timeout = Timeout::new(Duration::from_millis(100));

        let response = read(&handle, &tags, &in_ep, &out_ep, 1_048_576, 8, None, false, &timeout).unwrap();
        assert_eq!(response.len(), 8);
        assert!(mock.was_halt_cleared(in_ep.address));
    }

    #[test]
    fn bulk_out_timeout_triggers_abort_sequence() {
        let (out_ep, _in_ep) = endpoints();
        let mock = Arc::new(MockTransport::new());
        mock.queue_bulk_out_timeout(out_ep.address);
        mock.queue_control_in(control_requests::INITIATE_ABORT_BULK_OUT, vec![usbtmc_status::STATUS_SUCCESS, 0]);
        mock.queue_control_in(
            control_requests::CHECK_ABORT_BULK_OUT_STATUS,
            vec![usbtmc_status::STATUS_SUCCESS, 0, 0, 0, 0, 0, 0, 0],
        );

        let handle = Handle::new(mock.clone());
        let tags = TagAllocator::new();
        let timeout = Timeout::new(Duration::from_millis(10));

        let err = write(&handle, &tags, b"*RST", &out_ep, 1_048_576, &timeout).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(mock.was_halt_cleared(out_ep.address));

        let calls = mock.control_log();
        assert_eq!(calls[0].request, control_requests::INITIATE_ABORT_BULK_OUT);
        assert_eq!(calls[1].request, control_requests::CHECK_ABORT_BULK_OUT_STATUS);
    }

    #[test]
    fn advantest_quirk_skips_the_request_header() {
        let (out_ep, in_ep) = endpoints();
        let mock = Arc::new(MockTransport::new());

        let mut reply = header::encode_out(bulk_msg_id::DEVICE_DEPENDENT_MSG_IN, 1, 3, true).to_vec();
        reply.extend_from_slice(b"1.0");
        header::pad_to_alignment(&mut reply);
        mock.queue_bulk_in(in_ep.address, reply);

        let handle = Handle::new(mock.clone());
        let tags = TagAllocator::new();
        let timeout = Timeout::new(Duration::from_millis(100));

        let response = read(&handle, &tags, &in_ep, &out_ep, 1_048_576, usize::MAX, None, true, &timeout).unwrap();
        assert_eq!(response, b"1.0");
        assert!(mock.bulk_out_log().is_empty());
    }
}
