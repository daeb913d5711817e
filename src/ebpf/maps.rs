//! Config propagation into the probe's keyed table.

use super::ConfigTable;
use crate::mac::MacAddr;
use crate::{FlowlatError, Result};
use flowlat_common::MAC_LEN;
use tracing::{debug, info};

/// Write `mac` into keys 0..5, lowest key first.
///
/// On failure the error names the key that failed and the keys already
/// written; the table is then half-updated and must not be trusted.
pub fn write_address<T: ConfigTable + ?Sized>(table: &mut T, mac: MacAddr) -> Result<()> {
    let mut written = Vec::with_capacity(MAC_LEN);

    for (key, byte) in (0u32..).zip(mac.octets()) {
        if let Err(e) = table.set(key, byte) {
            return Err(FlowlatError::ConfigWrite {
                key,
                written,
                message: e.to_string(),
            });
        }
        debug!(key, value = byte, "config table entry written");
        written.push(key);
    }

    info!(%mac, "source address written to config table");
    Ok(())
}

/// Read keys 0..5 back as an address.
pub fn read_address<T: ConfigTable + ?Sized>(table: &T) -> Result<MacAddr> {
    let mut octets = [0u8; MAC_LEN];
    for (key, octet) in (0u32..).zip(octets.iter_mut()) {
        *octet = table.get(key).map_err(|e| FlowlatError::ConfigRead {
            key,
            message: e.to_string(),
        })?;
    }
    Ok(MacAddr(octets))
}

#[cfg(target_os = "linux")]
pub use aya_table::AyaConfigTable;

#[cfg(target_os = "linux")]
mod aya_table {
    use super::ConfigTable;
    use crate::{FlowlatError, Result};
    use aya::maps::{Array, MapData};

    /// The probe's `SMAC` array map.
    pub struct AyaConfigTable {
        inner: Array<MapData, u8>,
    }

    impl AyaConfigTable {
        pub fn new(inner: Array<MapData, u8>) -> Self {
            Self { inner }
        }
    }

    impl ConfigTable for AyaConfigTable {
        fn set(&mut self, key: u32, value: u8) -> Result<()> {
            self.inner
                .set(key, value, 0)
                .map_err(|e| FlowlatError::HookObject(e.to_string()))
        }

        fn get(&self, key: u32) -> Result<u8> {
            self.inner
                .get(&key, 0)
                .map_err(|e| FlowlatError::HookObject(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MemoryTable {
        entries: BTreeMap<u32, u8>,
        fail_at: Option<u32>,
        writes: Vec<u32>,
    }

    impl ConfigTable for MemoryTable {
        fn set(&mut self, key: u32, value: u8) -> Result<()> {
            if self.fail_at == Some(key) {
                return Err(FlowlatError::HookObject("E2BIG".to_string()));
            }
            self.writes.push(key);
            self.entries.insert(key, value);
            Ok(())
        }

        fn get(&self, key: u32) -> Result<u8> {
            self.entries
                .get(&key)
                .copied()
                .ok_or_else(|| FlowlatError::HookObject(format!("no entry for key {key}")))
        }
    }

    #[test]
    fn test_write_then_read_back() {
        let mac: MacAddr = "b0:48:7a:cf:ac:96".parse().unwrap();
        let mut table = MemoryTable::default();

        write_address(&mut table, mac).unwrap();

        assert_eq!(read_address(&table).unwrap(), mac);
        assert_eq!(table.writes, vec![0, 1, 2, 3, 4, 5], "ascending key order");
    }

    #[test]
    fn test_partial_write_reports_progress() {
        let mac: MacAddr = "01:02:03:04:05:06".parse().unwrap();
        let mut table = MemoryTable {
            fail_at: Some(3),
            ..Default::default()
        };

        let err = write_address(&mut table, mac).unwrap_err();
        match err {
            FlowlatError::ConfigWrite { key, written, .. } => {
                assert_eq!(key, 3);
                assert_eq!(written, vec![0, 1, 2]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(table.entries.len(), 3);
    }

    #[test]
    fn test_read_missing_key() {
        let mut table = MemoryTable::default();
        table.entries.insert(0, 0xaa);

        let err = read_address(&table).unwrap_err();
        assert!(matches!(err, FlowlatError::ConfigRead { key: 1, .. }));
    }
}
