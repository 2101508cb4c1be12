//! Tiered error model: silent drop, wire exception, and init-time fatal.

#[cfg_attr(not(test), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    ShortFrame,
    AddressMismatch,
    CrcMismatch,
}

/// Wire-visible exception codes (Modbus table 1).
#[cfg_attr(not(test), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveDeviceFailure = 0x04,
}

impl From<Exception> for u8 {
    fn from(e: Exception) -> u8 {
        e as u8
    }
}

/// `init()` failures. Configuration mistakes the host must fix before shipping.
///
/// The reference firmware's `Modbus_Init` also null-checks the UART handle
/// and buffer pointers; in this crate the link and buffers are owned values
/// (a `Link` instance, fixed-size arrays sized by a const generic), so a
/// null-handle failure mode has no safe-Rust equivalent and is not modeled.
#[cfg_attr(not(test), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    BufferTooSmall,
    InvalidAddress,
}
