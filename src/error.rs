//! ## USBTMC Errors
//!
//! The errors used throughout the crate.
//!

#[allow(unused)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no USB device matched the requested vendor/product/serial")]
    DeviceNotFound,
    #[error("device does not expose a USBTMC interface or is missing a required endpoint")]
    DeviceIncompatible,
    #[error("specified configuration not found")]
    ConfigurationNotFound,
    #[error("specified interface not found")]
    InterfaceNotFound,
    #[error("specified interface setting not found")]
    InterfaceSettingNotFound,
    #[error("bulk out endpoint not found")]
    BulkOutEndpointNotFound,
    #[error("bulk in endpoint not found")]
    BulkInEndpointNotFound,
    #[error("used incorrect endpoint")]
    IncorrectEndpoint,
    #[error("operating system refused to claim or detach the interface")]
    PermissionDenied,

    #[error("transfer exceeded its deadline")]
    Timeout,
    #[error("USB transfer failed: {0}")]
    IoError(String),
    #[error("decoded header did not match the expected message ID or bTag")]
    ProtocolMismatch,

    #[error("bulk in transfer cannot be aborted because FIFO is not empty")]
    BulkInFIFONotEmpty,
    #[error("no transfer in progress")]
    StatusNoTransferInProgress,
    #[error("control request failed")]
    StatusFailure,
    #[error("control request unexpectedly failed")]
    StatusUnexpectedFailure,
    #[error("abort state machine returned a non-pending failure status")]
    AbortFailed,
    #[error("abort state machine did not resolve within its bounded poll budget")]
    AbortTimeout,
    #[error("clear state machine returned a non-pending failure status")]
    ClearFailed,
    #[error("clear state machine did not resolve within its bounded poll budget")]
    ClearTimeout,

    #[error("resource string could not be parsed as USB[N]::vid::pid[::serial]::INSTR")]
    InvalidResource,
    #[error("operation requires the USB488 subclass, which this device does not advertise")]
    NotSupported,
}

impl From<rusb::Error> for Error {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => Error::Timeout,
            rusb::Error::Access => Error::PermissionDenied,
            rusb::Error::NoDevice | rusb::Error::NotFound => Error::DeviceNotFound,
            other => Error::IoError(other.to_string()),
        }
    }
}
