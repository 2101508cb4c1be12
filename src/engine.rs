//! The instance handle: double-buffer frame intake, validation, function
//! dispatch, and RS-485 link turnaround (§3, §4, §5).
//!
//! Synchronization note (§5): this crate declares no atomics and performs
//! no locking of its own. [`Engine::on_byte_run`]/[`Engine::on_tx_complete`]
//! run from the producer (interrupt) context; [`Engine::process`] runs from
//! the main loop. The host is responsible for serializing these calls
//! against each other on targets where the interrupt can preempt the main
//! loop mid-call (a critical section or RTIC resource lock around the
//! `process` call is the usual shape) — the handoff invariant from §4.1
//! only holds if the host provides that serialization.

use embedded_hal::digital::v2::OutputPin;

use crate::callbacks::{CustomConfigCallback, WriteCallback};
use crate::config::baud_from_index;
use crate::crc;
use crate::error::{Exception, InitError};
use crate::frame::{self, ResponseBuf};
use crate::registers::RegisterFile;

/// Logical polarity of the RS-485 DE/RE pin: which electrical level enables
/// the driver (transmit) output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

enum Direction {
    Transmit,
    Receive,
}

/// RS-485 direction-control binding: the DE/RE pin and its polarity.
pub struct Rs485Config<P> {
    pub pin: P,
    pub polarity: Polarity,
}

/// The narrow contract the serial port driver must satisfy (§1, §6). The
/// engine never configures baud rate, parity, or idle-line timing — it only
/// asks for a receive to be armed and a transmit to be dispatched.
pub trait Link {
    /// Arm the driver to fill `buf` with the next byte run, idle-line
    /// terminated. Called at `init` and after every completed receive.
    fn start_receive(&mut self, buf: &mut [u8]);

    /// Synchronous send; returns once all bytes are on the wire.
    fn transmit_blocking(&mut self, data: &[u8], timeout_ms: u32);

    /// Begin a non-blocking transfer. [`Engine::on_tx_complete`] resumes
    /// the RS-485 turnaround once the driver's DMA-complete interrupt fires.
    fn transmit_dma(&mut self, data: &[u8]);

    /// Poll the hardware transmit-complete flag. Used to spin before
    /// releasing the RS-485 bus so the last stop bit has actually clocked
    /// out (§4.4) — returning from `transmit_blocking`/`transmit_dma` only
    /// means bytes are enqueued.
    fn transmit_complete(&self) -> bool;
}

/// Construction-time configuration consumed by [`Engine::new`].
pub struct Config<L, P, U> {
    pub link: L,
    pub slave_addr: u8,
    pub baud_rate: u32,
    pub rs485: Option<Rs485Config<P>>,
    pub use_dma_tx: bool,
    pub use_crc_table: bool,
    pub write_cb: Option<WriteCallback<U>>,
    pub custom_config_cb: Option<CustomConfigCallback<U>>,
    pub user_data: U,
}

/// A Modbus RTU slave instance. `N` is the per-buffer capacity (receive A,
/// receive B, and transmit), minimum 8 octets, independently of any other
/// instance — instances share no module-level state (§9).
pub struct Engine<L, P, U, const N: usize = 256> {
    link: L,
    slave_addr: u8,
    baud_rate: u32,
    rx_a: [u8; N],
    rx_b: [u8; N],
    tx_buf: [u8; N],
    /// `true` while A is the buffer currently being filled by the producer.
    active_is_a: bool,
    /// Which buffer holds the pending frame, valid only while `ready`.
    pending_is_a: bool,
    ready: bool,
    pending_len: usize,
    rs485: Option<Rs485Config<P>>,
    use_dma_tx: bool,
    use_crc_table: bool,
    write_cb: Option<WriteCallback<U>>,
    custom_config_cb: Option<CustomConfigCallback<U>>,
    user_data: U,
}

impl<L: Link, P: OutputPin, U, const N: usize> Engine<L, P, U, N> {
    /// Validates configuration, arms the first receive, and returns the
    /// instance (§6, mirroring `Modbus_Init`'s validation order translated
    /// to owned-value Rust: buffer size, then address).
    pub fn new(mut config: Config<L, P, U>) -> Result<Self, InitError> {
        if N < 8 {
            return Err(InitError::BufferTooSmall);
        }
        if config.slave_addr < 1 || config.slave_addr > 247 {
            return Err(InitError::InvalidAddress);
        }

        if let Some(rs485) = &mut config.rs485 {
            Self::rs485_set_mode(rs485, Direction::Receive);
        }

        let mut engine = Self {
            link: config.link,
            slave_addr: config.slave_addr,
            baud_rate: config.baud_rate,
            rx_a: [0u8; N],
            rx_b: [0u8; N],
            tx_buf: [0u8; N],
            active_is_a: true,
            pending_is_a: false,
            ready: false,
            pending_len: 0,
            rs485: config.rs485,
            use_dma_tx: config.use_dma_tx,
            use_crc_table: config.use_crc_table,
            write_cb: config.write_cb,
            custom_config_cb: config.custom_config_cb,
            user_data: config.user_data,
        };
        engine.start_receive();

        #[cfg(not(test))]
        defmt::info!("modbus engine init: addr={}, baud={}", engine.slave_addr, engine.baud_rate);

        Ok(engine)
    }

    /// Re-arms the driver to fill the currently-active buffer. Exposed as
    /// an error-recovery hook (§6); also used internally after every
    /// completed receive.
    pub fn start_receive(&mut self) {
        let buf: &mut [u8] = if self.active_is_a {
            &mut self.rx_a
        } else {
            &mut self.rx_b
        };
        self.link.start_receive(buf);
    }

    /// Producer-context callback: the line just went idle after `count`
    /// octets (§4.1). Swaps buffer roles, records length, sets ready last.
    pub fn on_byte_run(&mut self, count: usize) {
        let len = count.min(N);
        self.pending_is_a = self.active_is_a;
        self.pending_len = len;
        self.active_is_a = !self.active_is_a;
        self.ready = true;
        self.start_receive();
    }

    /// Copies `data` into the active buffer and calls [`Engine::on_byte_run`].
    /// For producer drivers that can't target the engine's buffer directly
    /// with DMA (byte-at-a-time interrupt UARTs copying out of a ring
    /// buffer) and for exercising the engine end to end in tests.
    pub fn feed(&mut self, data: &[u8]) {
        let len = data.len().min(N);
        let buf: &mut [u8] = if self.active_is_a {
            &mut self.rx_a
        } else {
            &mut self.rx_b
        };
        buf[..len].copy_from_slice(&data[..len]);
        self.on_byte_run(len);
    }

    /// Producer-context callback after a DMA transmit completes. Spins on
    /// the transmit-complete flag, then restores RS-485 receive mode.
    pub fn on_tx_complete(&mut self) {
        if self.use_dma_tx {
            if let Some(rs485) = &mut self.rs485 {
                while !self.link.transmit_complete() {}
                Self::rs485_set_mode(rs485, Direction::Receive);
            }
        }
    }

    /// Services at most one pending frame (§6). No-op if nothing is ready.
    pub fn process(&mut self, registers: &mut RegisterFile<'_>) {
        if !self.ready {
            return;
        }
        let len = self.pending_len;
        let pending_is_a = self.pending_is_a;
        self.ready = false;
        self.pending_len = 0;

        let raw: &[u8] = if pending_is_a { &self.rx_a[..len] } else { &self.rx_b[..len] };

        let parsed = match frame::validate(raw, self.slave_addr, self.use_crc_table) {
            Ok(p) => p,
            Err(_reason) => {
                #[cfg(not(test))]
                defmt::trace!("modbus: dropped frame");
                return;
            }
        };

        let own_addr = self.slave_addr;
        let func_code = parsed.func_code;
        let body = parsed.raw;
        let body_len = body.len();

        let response = dispatch(
            own_addr,
            func_code,
            body,
            body_len,
            registers,
            self.write_cb,
            self.custom_config_cb,
            &mut self.user_data,
            self.use_crc_table,
        );

        #[cfg(not(test))]
        if response.len() == 5 && response[1] & 0x80 != 0 {
            defmt::debug!("modbus: exception {:x} on func {:x}", response[2], func_code);
        }

        self.send_response(&response);
    }

    fn send_response(&mut self, resp: &ResponseBuf) {
        let total_len = resp.len();
        if total_len > N {
            return;
        }
        self.tx_buf[..total_len].copy_from_slice(resp);

        if let Some(rs485) = &mut self.rs485 {
            Self::rs485_set_mode(rs485, Direction::Transmit);
        }

        if self.use_dma_tx {
            self.link.transmit_dma(&self.tx_buf[..total_len]);
            // RS-485 turnaround back to receive happens in on_tx_complete.
        } else {
            let timeout = blocking_timeout_ms(total_len, self.baud_rate);
            self.link.transmit_blocking(&self.tx_buf[..total_len], timeout);
            if let Some(rs485) = &mut self.rs485 {
                while !self.link.transmit_complete() {}
                Self::rs485_set_mode(rs485, Direction::Receive);
            }
        }
    }

    fn rs485_set_mode(rs485: &mut Rs485Config<P>, direction: Direction) {
        let drive_high = match (direction, rs485.polarity) {
            (Direction::Transmit, Polarity::ActiveHigh) => true,
            (Direction::Transmit, Polarity::ActiveLow) => false,
            (Direction::Receive, Polarity::ActiveHigh) => false,
            (Direction::Receive, Polarity::ActiveLow) => true,
        };
        if drive_high {
            let _ = rs485.pin.set_high();
        } else {
            let _ = rs485.pin.set_low();
        }
    }

    pub fn set_slave_addr(&mut self, addr: u8) {
        if (1..=247).contains(&addr) {
            self.slave_addr = addr;
        }
    }

    pub fn get_slave_addr(&self) -> u8 {
        self.slave_addr
    }

    /// Runtime reconfiguration only — the host must re-init the UART
    /// peripheral separately if the baud rate actually changes on the wire
    /// (§6); this just updates the value used for timeout computation.
    pub fn set_baud(&mut self, baud: u32) {
        if baud > 0 {
            self.baud_rate = baud;
        }
    }

    pub fn get_baud(&self) -> u32 {
        self.baud_rate
    }

    pub fn user_data(&self) -> &U {
        &self.user_data
    }

    pub fn user_data_mut(&mut self) -> &mut U {
        &mut self.user_data
    }

    pub fn set_user_data(&mut self, user_data: U) {
        self.user_data = user_data;
    }
}

/// `total_len · 10 · 1000 / baud_rate + max(tx_time_ms / 10, 50)`, floored
/// at 100 ms (§4.4). 10 bits/octet: 1 start + 8 data + 1 stop.
fn blocking_timeout_ms(total_len: usize, baud_rate: u32) -> u32 {
    if baud_rate == 0 {
        return 100;
    }
    let tx_time_ms = (total_len as u32) * 10 * 1000 / baud_rate;
    let margin = core::cmp::max(tx_time_ms / 10, 50);
    core::cmp::max(tx_time_ms + margin, 100)
}

#[allow(clippy::too_many_arguments)]
fn dispatch<U>(
    own_addr: u8,
    func_code: u8,
    raw: &[u8],
    len: usize,
    registers: &mut RegisterFile<'_>,
    write_cb: Option<WriteCallback<U>>,
    custom_config_cb: Option<CustomConfigCallback<U>>,
    user_data: &mut U,
    use_crc_table: bool,
) -> ResponseBuf {
    let exception = |code: Exception| frame::build_exception(own_addr, func_code, code, use_crc_table);

    match func_code {
        0x01 => read_bits(own_addr, func_code, raw, len, registers.coils.as_ref(), use_crc_table),
        0x02 => read_bits(
            own_addr,
            func_code,
            raw,
            len,
            registers.discrete_inputs.as_ref(),
            use_crc_table,
        ),
        0x03 => read_words(
            own_addr,
            func_code,
            raw,
            len,
            registers.holding_registers.as_ref(),
            use_crc_table,
        ),
        0x04 => read_words(
            own_addr,
            func_code,
            raw,
            len,
            registers.input_registers.as_ref(),
            use_crc_table,
        ),
        0x05 => write_single_coil(own_addr, raw, len, registers, write_cb, user_data, use_crc_table),
        0x06 => write_single_register(own_addr, raw, len, registers, write_cb, user_data, use_crc_table),
        0x0F => write_multiple_coils(own_addr, raw, len, registers, write_cb, user_data, use_crc_table),
        0x10 => write_multiple_registers(own_addr, raw, len, registers, write_cb, user_data, use_crc_table),
        0x64 => custom_config(own_addr, raw, len, custom_config_cb, user_data, use_crc_table),
        _ => exception(Exception::IllegalFunction),
    }
}

fn read_bits(
    own_addr: u8,
    func_code: u8,
    raw: &[u8],
    len: usize,
    region: Option<&crate::registers::BitRegion<'_>>,
    use_crc_table: bool,
) -> ResponseBuf {
    let exception = |code: Exception| frame::build_exception(own_addr, func_code, code, use_crc_table);
    let Some(region) = region else {
        return exception(Exception::IllegalFunction);
    };
    if len != 8 {
        return exception(Exception::IllegalDataValue);
    }
    let (Some(start), Some(quantity)) = (frame::read_u16_be(raw, 2), frame::read_u16_be(raw, 4)) else {
        return exception(Exception::IllegalDataValue);
    };
    if !(1..=2000).contains(&quantity) {
        return exception(Exception::IllegalDataValue);
    }
    if start as u32 + quantity as u32 > region.len() as u32 {
        return exception(Exception::IllegalDataAddress);
    }

    let byte_count = ((quantity + 7) / 8) as usize;
    let mut payload = heapless::Vec::<u8, 256>::new();
    let _ = payload.push(byte_count as u8);
    for _ in 0..byte_count {
        let _ = payload.push(0);
    }
    for i in 0..quantity {
        if region.get(start + i) {
            payload[1 + (i as usize) / 8] |= 1 << (i % 8);
        }
    }
    frame::build_response(own_addr, func_code, &payload, use_crc_table)
}

fn read_words(
    own_addr: u8,
    func_code: u8,
    raw: &[u8],
    len: usize,
    region: Option<&crate::registers::WordRegion<'_>>,
    use_crc_table: bool,
) -> ResponseBuf {
    let exception = |code: Exception| frame::build_exception(own_addr, func_code, code, use_crc_table);
    let Some(region) = region else {
        return exception(Exception::IllegalFunction);
    };
    if len != 8 {
        return exception(Exception::IllegalDataValue);
    }
    let (Some(start), Some(quantity)) = (frame::read_u16_be(raw, 2), frame::read_u16_be(raw, 4)) else {
        return exception(Exception::IllegalDataValue);
    };
    if !(1..=125).contains(&quantity) {
        return exception(Exception::IllegalDataValue);
    }
    if start as u32 + quantity as u32 > region.len() as u32 {
        return exception(Exception::IllegalDataAddress);
    }

    let mut payload = heapless::Vec::<u8, 256>::new();
    let _ = payload.push((quantity * 2) as u8);
    for i in 0..quantity {
        let word = region.get(start + i);
        let _ = payload.push((word >> 8) as u8);
        let _ = payload.push((word & 0xFF) as u8);
    }
    frame::build_response(own_addr, func_code, &payload, use_crc_table)
}

fn write_single_coil<U>(
    own_addr: u8,
    raw: &[u8],
    len: usize,
    registers: &mut RegisterFile<'_>,
    write_cb: Option<WriteCallback<U>>,
    user_data: &mut U,
    use_crc_table: bool,
) -> ResponseBuf {
    let func_code = 0x05;
    let exception = |code: Exception| frame::build_exception(own_addr, func_code, code, use_crc_table);
    let Some(region) = registers.coils.as_mut() else {
        return exception(Exception::IllegalFunction);
    };
    if len != 8 {
        return exception(Exception::IllegalDataValue);
    }
    let (Some(addr), Some(value)) = (frame::read_u16_be(raw, 2), frame::read_u16_be(raw, 4)) else {
        return exception(Exception::IllegalDataValue);
    };
    if addr >= region.len() {
        return exception(Exception::IllegalDataAddress);
    }
    if let Some(cb) = write_cb {
        if !cb(user_data, func_code, addr, 1) {
            return exception(Exception::SlaveDeviceFailure);
        }
    }
    match value {
        0xFF00 => region.set(addr, true),
        0x0000 => region.set(addr, false),
        _ => {} // neither set nor clear; frame is still echoed per §4.3
    }
    frame::build_response(own_addr, func_code, &raw[2..6], use_crc_table)
}

fn write_single_register<U>(
    own_addr: u8,
    raw: &[u8],
    len: usize,
    registers: &mut RegisterFile<'_>,
    write_cb: Option<WriteCallback<U>>,
    user_data: &mut U,
    use_crc_table: bool,
) -> ResponseBuf {
    let func_code = 0x06;
    let exception = |code: Exception| frame::build_exception(own_addr, func_code, code, use_crc_table);
    let Some(region) = registers.holding_registers.as_mut() else {
        return exception(Exception::IllegalFunction);
    };
    if len != 8 {
        return exception(Exception::IllegalDataValue);
    }
    let (Some(addr), Some(value)) = (frame::read_u16_be(raw, 2), frame::read_u16_be(raw, 4)) else {
        return exception(Exception::IllegalDataValue);
    };
    if addr >= region.len() {
        return exception(Exception::IllegalDataAddress);
    }
    if let Some(cb) = write_cb {
        if !cb(user_data, func_code, addr, 1) {
            return exception(Exception::SlaveDeviceFailure);
        }
    }
    region.set(addr, value);
    frame::build_response(own_addr, func_code, &raw[2..6], use_crc_table)
}

fn write_multiple_coils<U>(
    own_addr: u8,
    raw: &[u8],
    len: usize,
    registers: &mut RegisterFile<'_>,
    write_cb: Option<WriteCallback<U>>,
    user_data: &mut U,
    use_crc_table: bool,
) -> ResponseBuf {
    let func_code = 0x0F;
    let exception = |code: Exception| frame::build_exception(own_addr, func_code, code, use_crc_table);
    let Some(region) = registers.coils.as_mut() else {
        return exception(Exception::IllegalFunction);
    };
    if len < 9 {
        return exception(Exception::IllegalDataValue);
    }
    let (Some(addr), Some(quantity)) = (frame::read_u16_be(raw, 2), frame::read_u16_be(raw, 4)) else {
        return exception(Exception::IllegalDataValue);
    };
    let byte_count = raw[6] as usize;
    if len != 9 + byte_count || byte_count != ((quantity + 7) / 8) as usize {
        return exception(Exception::IllegalDataValue);
    }
    if addr as u32 + quantity as u32 > region.len() as u32 {
        return exception(Exception::IllegalDataAddress);
    }
    if let Some(cb) = write_cb {
        if !cb(user_data, func_code, addr, quantity) {
            return exception(Exception::SlaveDeviceFailure);
        }
    }
    for i in 0..quantity {
        let data_byte = raw[7 + (i as usize) / 8];
        let bit = (data_byte >> (i % 8)) & 0x01 != 0;
        region.set(addr + i, bit);
    }
    frame::build_response(own_addr, func_code, &raw[2..6], use_crc_table)
}

fn write_multiple_registers<U>(
    own_addr: u8,
    raw: &[u8],
    len: usize,
    registers: &mut RegisterFile<'_>,
    write_cb: Option<WriteCallback<U>>,
    user_data: &mut U,
    use_crc_table: bool,
) -> ResponseBuf {
    let func_code = 0x10;
    let exception = |code: Exception| frame::build_exception(own_addr, func_code, code, use_crc_table);
    let Some(region) = registers.holding_registers.as_mut() else {
        return exception(Exception::IllegalFunction);
    };
    if len < 9 {
        return exception(Exception::IllegalDataValue);
    }
    let (Some(addr), Some(quantity)) = (frame::read_u16_be(raw, 2), frame::read_u16_be(raw, 4)) else {
        return exception(Exception::IllegalDataValue);
    };
    let byte_count = raw[6] as usize;
    if len != 9 + byte_count || byte_count != quantity as usize * 2 {
        return exception(Exception::IllegalDataValue);
    }
    if addr as u32 + quantity as u32 > region.len() as u32 {
        return exception(Exception::IllegalDataAddress);
    }
    if let Some(cb) = write_cb {
        if !cb(user_data, func_code, addr, quantity) {
            return exception(Exception::SlaveDeviceFailure);
        }
    }
    for i in 0..quantity {
        let offset = 7 + (i as usize) * 2;
        let word = u16::from_be_bytes([raw[offset], raw[offset + 1]]);
        region.set(addr + i, word);
    }
    frame::build_response(own_addr, func_code, &raw[2..6], use_crc_table)
}

fn custom_config<U>(
    own_addr: u8,
    raw: &[u8],
    len: usize,
    custom_config_cb: Option<CustomConfigCallback<U>>,
    user_data: &mut U,
    use_crc_table: bool,
) -> ResponseBuf {
    let func_code = 0x64;
    let exception = |code: Exception| frame::build_exception(own_addr, func_code, code, use_crc_table);
    if len != 8 {
        return exception(Exception::IllegalDataValue);
    }
    let Some(cb) = custom_config_cb else {
        return exception(Exception::IllegalFunction);
    };
    let (Some(param_addr), Some(param_val)) = (frame::read_u16_be(raw, 2), frame::read_u16_be(raw, 4)) else {
        return exception(Exception::IllegalDataValue);
    };
    if cb(user_data, param_addr, param_val) {
        frame::build_response(own_addr, func_code, &raw[2..6], use_crc_table)
    } else {
        exception(Exception::IllegalDataValue)
    }
}

/// Validates a `0x64` write against the predefined param_addr semantics
/// (§4.3) a `custom_config_cb` is expected to honor. Not wired into the
/// engine directly — the callback owns the decision — but exposed so a
/// host's callback can reuse this exact validation instead of re-deriving
/// it.
pub fn validate_custom_config(param_addr: u16, param_val: u16) -> bool {
    match param_addr {
        0x0000 => (1..=247).contains(&param_val),
        0x0001 => baud_from_index(param_val).is_some(),
        _ => true,
    }
}
