//! Persisted configuration record (§3, §6) and the baud-index table used by
//! function 0x64. The engine never reads or writes this record directly —
//! it only flips [`DeferredWork`] flags the host drains in its idle loop.

use modular_bitfield::prelude::*;

const MAGIC: u32 = 0x4D42_5331; // "MBS1"

/// Mirrors `options::Options`'s `#[bitfield]` layout technique, scoped to
/// the four fields a persisted record needs here.
#[bitfield]
#[derive(Default, Debug, Clone, Copy)]
pub struct PersistedConfig {
    pub magic: B32,
    pub slave_addr: B8,
    pub baud_rate: B32,
    padding: B8,
}

impl PersistedConfig {
    pub fn new(slave_addr: u8, baud_rate: u32) -> Self {
        let mut cfg = Self::new_blank();
        cfg.set_magic(MAGIC);
        cfg.set_slave_addr(slave_addr);
        cfg.set_baud_rate(baud_rate);
        cfg
    }

    fn new_blank() -> Self {
        <Self as Default>::default()
    }

    /// Sentinel comparison; on mismatch the host substitutes its defaults
    /// (address 1, baud 9600) per §6 rather than trusting the record.
    pub fn validate(&self) -> Result<(u8, u32), ()> {
        if self.magic() != MAGIC {
            return Err(());
        }
        Ok((self.slave_addr(), self.baud_rate()))
    }
}

/// Baud-rate index table for function 0x64, param_addr 0x0001. Index 0 is
/// reserved invalid; valid range is [1, 8].
const BAUD_TABLE: [u32; 9] = [0, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

pub fn baud_from_index(index: u16) -> Option<u32> {
    BAUD_TABLE.get(index as usize).copied().filter(|&b| b != 0)
}

/// Work the 0x64 callback requested but must not perform inline (flash
/// erase/program, system reset). The host's idle loop drains this.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeferredWork {
    pub save_requested: bool,
    pub reset_requested: bool,
}

impl DeferredWork {
    pub const fn new() -> Self {
        Self {
            save_requested: false,
            reset_requested: false,
        }
    }

    pub fn request_save(&mut self) {
        self.save_requested = true;
    }

    pub fn take_save(&mut self) -> bool {
        core::mem::replace(&mut self.save_requested, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_record_roundtrips() {
        let cfg = PersistedConfig::new(0x11, 19200);
        assert_eq!(cfg.validate(), Ok((0x11, 19200)));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut cfg = PersistedConfig::new(0x11, 19200);
        cfg.set_magic(0);
        assert_eq!(cfg.validate(), Err(()));
    }

    #[test]
    fn baud_table_matches_spec_entries() {
        assert_eq!(baud_from_index(0), None);
        assert_eq!(baud_from_index(1), Some(1200));
        assert_eq!(baud_from_index(4), Some(9600));
        assert_eq!(baud_from_index(8), Some(115200));
        assert_eq!(baud_from_index(9), None);
    }

    #[test]
    fn deferred_work_take_clears_flag() {
        let mut w = DeferredWork::new();
        w.request_save();
        assert!(w.take_save());
        assert!(!w.take_save());
    }
}
