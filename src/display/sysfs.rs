//! Connector status probe via sysfs.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    Connected,
    Disconnected,
    Unknown,
}

/// Keeps the status file open and seeks to the start before every read,
/// rather than re-opening it each time: the file never goes away for the
/// lifetime of a connected monitor, and seeking is cheaper than a fresh
/// open/stat/close cycle on every frame.
pub struct ConnectorStatusProbe {
    file: File,
}

impl ConnectorStatusProbe {
    pub fn open(card_minor: u32, port: &str) -> std::io::Result<Self> {
        let path: PathBuf = format!("/sys/class/drm/card{card_minor}-{port}/status").into();
        let file = File::open(path)?;
        Ok(Self { file })
    }

    pub fn read(&mut self) -> std::io::Result<ConnectorStatus> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = String::new();
        self.file.read_to_string(&mut buf)?;
        Ok(match buf.trim() {
            "connected" => ConnectorStatus::Connected,
            "disconnected" => ConnectorStatus::Disconnected,
            _ => ConnectorStatus::Unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        std::fs::write(&path, "connected\n").unwrap();
        let mut probe = ConnectorStatusProbe {
            file: File::open(&path).unwrap(),
        };
        assert_eq!(probe.read().unwrap(), ConnectorStatus::Connected);
    }

    #[test]
    fn parses_disconnected_after_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        std::fs::write(&path, "connected\n").unwrap();
        let mut probe = ConnectorStatusProbe {
            file: File::open(&path).unwrap(),
        };
        assert_eq!(probe.read().unwrap(), ConnectorStatus::Connected);

        std::fs::write(&path, "disconnected\n").unwrap();
        assert_eq!(probe.read().unwrap(), ConnectorStatus::Disconnected);
    }
}
