use std::io::{self, Write};

use ipacct_config::AppConfig;

use crate::event::{AccountRecord, LossRecord};
use crate::format::AddressFormatter;
use crate::plugin::{Plugin, PluginError};

/// Writes one line per record to a sink (stdout by default).
pub struct DebugPlugin {
    formatter: AddressFormatter,
    out: Box<dyn Write + Send>,
}

impl DebugPlugin {
    pub fn new(formatter: AddressFormatter, out: Box<dyn Write + Send>) -> Self {
        Self { formatter, out }
    }

    pub fn from_config(config: &AppConfig) -> Result<Box<dyn Plugin>, PluginError> {
        let groups = config
            .groups()
            .map_err(|e| PluginError::Config(e.to_string()))?;
        Ok(Box::new(Self::new(
            AddressFormatter::new(&groups),
            Box::new(io::stdout()),
        )))
    }
}

impl Plugin for DebugPlugin {
    fn name(&self) -> &str {
        "debug"
    }

    fn account(&mut self, record: &AccountRecord) -> Result<(), PluginError> {
        let address = self
            .formatter
            .format(record.group, record.address.as_bytes())?;
        writeln!(
            self.out,
            "group {}: {} bytes for {}",
            record.group, record.value, address
        )?;
        Ok(())
    }

    fn loss(&mut self, record: &LossRecord) -> Result<(), PluginError> {
        writeln!(
            self.out,
            "group {}: lost at least {} packets",
            record.group, record.count
        )?;
        Ok(())
    }

    fn end_write(&mut self) -> Result<(), PluginError> {
        writeln!(self.out, "round complete")?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use std::time::SystemTime;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn plugin(out: Shared) -> DebugPlugin {
        let config = AppConfig::parse(
            r#"
            [groups.1]
            kind = "ipv4src"
            [groups.2]
            kind = "ipv6dst"
            "#,
        )
        .unwrap();
        let formatter = AddressFormatter::new(&config.groups().unwrap());
        DebugPlugin::new(formatter, Box::new(out))
    }

    #[test]
    fn test_writes_one_line_per_record() {
        let out = Shared::default();
        let mut debug = plugin(out.clone());

        debug.start_write().unwrap();
        debug
            .account(&AccountRecord {
                timestamp: SystemTime::now(),
                group: 1,
                address: [10u8, 1, 2, 3][..].into(),
                value: 4096,
            })
            .unwrap();
        debug
            .loss(&LossRecord {
                timestamp: SystemTime::now(),
                group: 2,
                count: 17,
            })
            .unwrap();
        debug.end_write().unwrap();

        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        assert_eq!(
            text,
            "group 1: 4096 bytes for 10.1.2.3\n\
             group 2: lost at least 17 packets\n\
             round complete\n"
        );
    }

    #[test]
    fn test_wrong_address_length_is_an_error() {
        let mut debug = plugin(Shared::default());
        let result = debug.account(&AccountRecord {
            timestamp: SystemTime::now(),
            group: 2,
            address: [10u8, 1, 2, 3][..].into(),
            value: 1,
        });
        assert!(matches!(result, Err(PluginError::Format(_))));
    }
}
