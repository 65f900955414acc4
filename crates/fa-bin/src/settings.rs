//! Daemon settings.
//!
//! The archiver takes its configuration from an optional TOML file plus
//! command-line flags; a flag always wins over the file. The file keeps
//! site deployments (device path, port, buffer sizing) out of the unit
//! files that launch the daemon.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiverSettings {
    /// Ring buffer size in input blocks.
    pub buffer_blocks: usize,
    /// Bind address for the socket server.
    pub bind_address: String,
    pub port: u16,
    /// Sniffer device node.
    pub device: String,
    /// Run the sniffer thread at SCHED_FIFO priority 1.
    pub boost_priority: bool,
    /// Honour `M` mask-update requests.
    pub allow_mask_update: bool,
}

impl Default for ArchiverSettings {
    fn default() -> Self {
        ArchiverSettings {
            buffer_blocks: 64,
            bind_address: "0.0.0.0".into(),
            port: 8888,
            device: "/dev/fa_sniffer0".into(),
            boost_priority: false,
            allow_mask_update: false,
        }
    }
}

/// Load settings from `path`, or the defaults when no file is given.
pub fn load(path: Option<&Path>) -> anyhow::Result<ArchiverSettings> {
    let Some(path) = path else {
        return Ok(ArchiverSettings::default());
    };
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .with_context(|| format!("reading settings file {}", path.display()))?
        .try_deserialize()
        .with_context(|| format!("parsing settings file {}", path.display()))?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_argument_yields_defaults() {
        let settings = load(None).unwrap();
        assert_eq!(settings.port, 8888);
        assert_eq!(settings.buffer_blocks, 64);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archiver.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "port = 9021\ndevice = \"/dev/fa_sniffer1\"").unwrap();

        let settings = load(Some(&path)).unwrap();
        assert_eq!(settings.port, 9021);
        assert_eq!(settings.device, "/dev/fa_sniffer1");
        assert_eq!(settings.buffer_blocks, 64, "untouched fields keep defaults");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archiver.toml");
        std::fs::write(&path, "prot = 9021\n").unwrap();
        assert!(load(Some(&path)).is_err());
    }
}
