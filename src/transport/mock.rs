//! ## Mock transport
//!
//! A scriptable, in-memory [`UsbTransport`] used to drive the bulk protocol
//! engine and control-request façade end to end without real hardware. Test
//! code queues canned responses per endpoint (bulk-IN) or per `bRequest`
//! (control-IN) and can then inspect everything that was written out to
//! assert on wire bytes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::{TransportResult, UsbTransport};
use crate::error::Error;

/// One canned reply to the next matching `read_bulk`/`read_control` call.
#[derive(Debug, Clone)]
pub enum MockReply {
    Data(Vec<u8>),
    Timeout,
}

/// A recorded control transfer, for assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCall {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

#[derive(Default)]
struct Inner {
    bulk_out_log: Vec<(u8, Vec<u8>)>,
    control_log: Vec<ControlCall>,
    bulk_in_queue: HashMap<u8, VecDeque<MockReply>>,
    control_in_queue: HashMap<u8, VecDeque<MockReply>>,
    bulk_out_timeouts: HashSet<u8>,
    halted: HashSet<u8>,
    claimed: HashSet<u8>,
    kernel_driver_active: HashMap<u8, bool>,
}

pub struct MockTransport {
    inner: Mutex<Inner>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Queue a reply for the next `read_bulk` issued against `endpoint`.
    pub fn queue_bulk_in(&self, endpoint: u8, data: Vec<u8>) {
        self.inner
            .lock()
            .unwrap()
            .bulk_in_queue
            .entry(endpoint)
            .or_default()
            .push_back(MockReply::Data(data));
    }

    /// Queue a timeout for the next `read_bulk` issued against `endpoint`.
    pub fn queue_bulk_in_timeout(&self, endpoint: u8) {
        self.inner
            .lock()
            .unwrap()
            .bulk_in_queue
            .entry(endpoint)
            .or_default()
            .push_back(MockReply::Timeout);
    }

    /// Queue a reply for the next `read_control` issued with this `bRequest`.
    pub fn queue_control_in(&self, request: u8, data: Vec<u8>) {
        self.inner
            .lock()
            .unwrap()
            .control_in_queue
            .entry(request)
            .or_default()
            .push_back(MockReply::Data(data));
    }

    /// Make the next `write_bulk` issued against `endpoint` fail with a timeout.
    pub fn queue_bulk_out_timeout(&self, endpoint: u8) {
        self.inner.lock().unwrap().bulk_out_timeouts.insert(endpoint);
    }

    /// Mark an interface as having a kernel driver attached, for resolver/open tests.
    pub fn set_kernel_driver_active(&self, interface_number: u8, active: bool) {
        self.inner
            .lock()
            .unwrap()
            .kernel_driver_active
            .insert(interface_number, active);
    }

    /// Every bulk-OUT transfer issued so far, in order, as `(endpoint, bytes)`.
    pub fn bulk_out_log(&self) -> Vec<(u8, Vec<u8>)> {
        self.inner.lock().unwrap().bulk_out_log.clone()
    }

    /// Every control transfer issued so far, in order.
    pub fn control_log(&self) -> Vec<ControlCall> {
        self.inner.lock().unwrap().control_log.clone()
    }

    /// Whether `clear_halt` was ever called for this endpoint.
    pub fn was_halt_cleared(&self, endpoint: u8) -> bool {
        self.inner.lock().unwrap().halted.contains(&endpoint)
    }

    /// How many outstanding bulk-IN replies remain queued for `endpoint`.
    pub fn pending_bulk_in(&self, endpoint: u8) -> usize {
        self.inner
            .lock()
            .unwrap()
            .bulk_in_queue
            .get(&endpoint)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn write_bulk(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> TransportResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.bulk_out_timeouts.remove(&endpoint) {
            return Err(Error::Timeout);
        }
        inner.bulk_out_log.push((endpoint, data.to_vec()));
        Ok(data.len())
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], _timeout: Duration) -> TransportResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        let reply = inner
            .bulk_in_queue
            .get_mut(&endpoint)
            .and_then(|q| q.pop_front());
        match reply {
            Some(MockReply::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(MockReply::Timeout) | None => Err(Error::Timeout),
        }
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> TransportResult<usize> {
        // The interrupt-IN endpoint carries the same kind of canned replies
        // as bulk-IN in this mock; keyed separately by convention (endpoint
        // addresses never collide between the two transfer types).
        self.read_bulk(endpoint, buf, timeout)
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> TransportResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.control_log.push(ControlCall {
            request_type,
            request,
            value,
            index,
        });
        let reply = inner
            .control_in_queue
            .get_mut(&request)
            .and_then(|q| q.pop_front());
        match reply {
            Some(MockReply::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(MockReply::Timeout) | None => Err(Error::Timeout),
        }
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        _data: &[u8],
        _timeout: Duration,
    ) -> TransportResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.control_log.push(ControlCall {
            request_type,
            request,
            value,
            index,
        });
        Ok(0)
    }

    fn clear_halt(&self, endpoint: u8) -> TransportResult<()> {
        self.inner.lock().unwrap().halted.insert(endpoint);
        Ok(())
    }

    fn claim_interface(&self, interface_number: u8) -> TransportResult<()> {
        self.inner.lock().unwrap().claimed.insert(interface_number);
        Ok(())
    }

    fn release_interface(&self, interface_number: u8) -> TransportResult<()> {
        self.inner.lock().unwrap().claimed.remove(&interface_number);
        Ok(())
    }

    fn set_active_configuration(&self, _config_number: u8) -> TransportResult<()> {
        Ok(())
    }

    fn set_alternate_setting(&self, _interface_number: u8, _setting_number: u8) -> TransportResult<()> {
        Ok(())
    }

    fn kernel_driver_active(&self, interface_number: u8) -> TransportResult<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .kernel_driver_active
            .get(&interface_number)
            .copied()
            .unwrap_or(false))
    }

    fn detach_kernel_driver(&self, interface_number: u8) -> TransportResult<()> {
        self.inner
            .lock()
            .unwrap()
            .kernel_driver_active
            .insert(interface_number, false);
        Ok(())
    }

    fn attach_kernel_driver(&self, interface_number: u8) -> TransportResult<()> {
        self.inner
            .lock()
            .unwrap()
            .kernel_driver_active
            .insert(interface_number, true);
        Ok(())
    }
}

/// Lets tests keep a handle on the same `MockTransport` they handed to a
/// [`crate::types::Handle`] (which takes ownership of whatever it's given).
impl UsbTransport for std::sync::Arc<MockTransport> {
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> TransportResult<usize> {
        (**self).write_bulk(endpoint, data, timeout)
    }
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> TransportResult<usize> {
        (**self).read_bulk(endpoint, buf, timeout)
    }
    fn read_interrupt(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> TransportResult<usize> {
        (**self).read_interrupt(endpoint, buf, timeout)
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
        (**self).read_control(request_type, request, value, index, buf, timeout)
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
        (**self).write_control(request_type, request, value, index, data, timeout)
    }
    fn clear_halt(&self, endpoint: u8) -> TransportResult<()> {
        (**self).clear_halt(endpoint)
    }
    fn claim_interface(&self, interface_number: u8) -> TransportResult<()> {
        (**self).claim_interface(interface_number)
    }
    fn release_interface(&self, interface_number: u8) -> TransportResult<()> {
        (**self).release_interface(interface_number)
    }
    fn set_active_configuration(&self, config_number: u8) -> TransportResult<()> {
        (**self).set_active_configuration(config_number)
    }
    fn set_alternate_setting(&self, interface_number: u8, setting_number: u8) -> TransportResult<()> {
        (**self).set_alternate_setting(interface_number, setting_number)
    }
    fn kernel_driver_active(&self, interface_number: u8) -> TransportResult<bool> {
        (**self).kernel_driver_active(interface_number)
    }
    fn detach_kernel_driver(&self, interface_number: u8) -> TransportResult<()> {
        (**self).detach_kernel_driver(interface_number)
    }
    fn attach_kernel_driver(&self, interface_number: u8) -> TransportResult<()> {
        (**self).attach_kernel_driver(interface_number)
    }
}
