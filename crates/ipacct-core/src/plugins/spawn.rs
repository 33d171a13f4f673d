//! Spawns `sh -c <cmdline>` once per round and writes one line per record
//! to its stdin: `timestamp/group/address/bytes`. The round fails if the
//! command exits unsuccessfully.

use std::io::{BufWriter, Write};
use std::process::{Child, ChildStdin, Command, Stdio};

use ipacct_config::AppConfig;
use tracing::{debug, warn};

use crate::event::{AccountRecord, unix_seconds};
use crate::format::AddressFormatter;
use crate::plugin::{Plugin, PluginError};

struct Running {
    child: Child,
    stdin: BufWriter<ChildStdin>,
}

pub struct SpawnPlugin {
    cmdline: String,
    formatter: AddressFormatter,
    running: Option<Running>,
}

impl SpawnPlugin {
    pub fn new(cmdline: impl Into<String>, formatter: AddressFormatter) -> Self {
        Self {
            cmdline: cmdline.into(),
            formatter,
            running: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Box<dyn Plugin>, PluginError> {
        let spawn = config.plugins.spawn.as_ref().ok_or_else(|| {
            PluginError::Config("the spawn plugin needs plugins.spawn.cmdline".to_string())
        })?;
        let groups = config
            .groups()
            .map_err(|e| PluginError::Config(e.to_string()))?;
        Ok(Box::new(Self::new(
            spawn.cmdline.clone(),
            AddressFormatter::new(&groups),
        )))
    }

    fn running(&mut self) -> Result<&mut Running, PluginError> {
        self.running
            .as_mut()
            .ok_or_else(|| PluginError::Backend("record received outside of a round".to_string()))
    }
}

impl Plugin for SpawnPlugin {
    fn name(&self) -> &str {
        "spawn"
    }

    fn start_write(&mut self) -> Result<(), PluginError> {
        if self.running.is_some() {
            return Err(PluginError::Backend(
                "previous round was never completed".to_string(),
            ));
        }
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&self.cmdline)
            .stdin(Stdio::piped())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::Backend("child stdin unavailable".to_string()))?;
        debug!(pid = child.id(), cmdline = %self.cmdline, "round command started");
        self.running = Some(Running {
            child,
            stdin: BufWriter::new(stdin),
        });
        Ok(())
    }

    fn account(&mut self, record: &AccountRecord) -> Result<(), PluginError> {
        let address = self
            .formatter
            .format(record.group, record.address.as_bytes())?;
        let running = self.running()?;
        writeln!(
            running.stdin,
            "{}/{}/{}/{}",
            unix_seconds(record.timestamp),
            record.group,
            address,
            record.value
        )?;
        Ok(())
    }

    fn end_write(&mut self) -> Result<(), PluginError> {
        let Running { mut child, stdin } = self
            .running
            .take()
            .ok_or_else(|| PluginError::Backend("round end without a round".to_string()))?;
        let stdin = stdin
            .into_inner()
            .map_err(|e| PluginError::Io(e.into_error()))?;
        drop(stdin);

        let status = child.wait()?;
        if !status.success() {
            return Err(PluginError::Backend(format!(
                "`{}` failed with {status}",
                self.cmdline
            )));
        }
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), PluginError> {
        if let Some(Running { mut child, stdin }) = self.running.take() {
            warn!(pid = child.id(), "round command still running at shutdown, killing it");
            drop(stdin);
            if let Err(e) = child.kill() {
                debug!(error = %e, "kill failed, child probably exited");
            }
            child.wait()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn formatter() -> AddressFormatter {
        let config = AppConfig::parse(
            r#"
            [groups.4]
            kind = "ipv4dst"
            "#,
        )
        .unwrap();
        AddressFormatter::new(&config.groups().unwrap())
    }

    fn record(secs: u64, address: [u8; 4], value: u64) -> AccountRecord {
        AccountRecord {
            timestamp: UNIX_EPOCH + Duration::from_secs(secs),
            group: 4,
            address: address[..].into(),
            value,
        }
    }

    #[test]
    fn test_round_is_piped_to_command() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("round.txt");
        let mut plugin = SpawnPlugin::new(format!("cat > '{}'", out.display()), formatter());

        plugin.start_write().unwrap();
        plugin.account(&record(1_700_000_000, [10, 0, 0, 1], 1500)).unwrap();
        plugin.account(&record(1_700_000_000, [10, 0, 0, 2], 40)).unwrap();
        plugin.end_write().unwrap();

        assert_eq!(
            std::fs::read_to_string(&out).unwrap(),
            "1700000000/4/10.0.0.1/1500\n1700000000/4/10.0.0.2/40\n"
        );
    }

    #[test]
    fn test_failing_command_fails_the_round() {
        let mut plugin = SpawnPlugin::new("exit 3", formatter());
        plugin.start_write().unwrap();
        let err = plugin.end_write().unwrap_err();
        assert!(err.to_string().contains("exit status: 3"), "{err}");
    }

    #[test]
    fn test_account_outside_round_is_an_error() {
        let mut plugin = SpawnPlugin::new("cat", formatter());
        assert!(matches!(
            plugin.account(&record(0, [1, 1, 1, 1], 1)),
            Err(PluginError::Backend(_))
        ));
    }

    #[test]
    fn test_terminate_kills_unfinished_round() {
        let mut plugin = SpawnPlugin::new("sleep 30", formatter());
        plugin.start_write().unwrap();
        plugin.terminate().unwrap();
        assert!(plugin.running.is_none());
    }

    #[test]
    fn test_missing_cmdline_is_a_config_error() {
        let result = SpawnPlugin::from_config(&AppConfig::default());
        assert!(matches!(result, Err(PluginError::Config(_))));
    }
}
