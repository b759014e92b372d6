//! Audit logging for key lifecycle and export events

use crate::{DatabaseError, Result, SyncCoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;

/// Audit log entry types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    /// Key lifecycle
    KeyGenerated {
        key_id: String,
        persisted: bool,
    },
    /// The default key was created implicitly on first use
    DefaultKeyAutoGenerated {
        key_id: String,
        trigger: String,
    },
    KeyRotated {
        key_id: String,
        archived_as: String,
    },
    KeyDeleted {
        key_id: String,
    },
    KeysUnlocked,
    KeysLocked,

    /// Data migration
    RecordsReencrypted {
        key_id: String,
        count: usize,
    },

    /// Export
    SnapshotExported {
        key_id: String,
        records: usize,
    },
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Timestamp of the event
    pub timestamp: DateTime<Utc>,
    /// Event type
    pub event_type: AuditEventType,
    /// Event severity (0-5, where 5 is most critical)
    pub severity: u8,
    /// Additional context data
    pub context: String,
    /// Process ID
    pub pid: u32,
}

enum Sink {
    File { path: PathBuf, file: File },
    Memory(Vec<String>),
}

/// Audit logger
pub struct AuditLogger {
    sink: Mutex<Sink>,
}

impl AuditLogger {
    /// Create an audit logger appending to `audit.log` in `log_dir`
    pub fn new(log_dir: PathBuf) -> Result<Self> {
        let path = log_dir.join("audit.log");

        std::fs::create_dir_all(&log_dir).map_err(|e| {
            DatabaseError::FileIo(format!("Failed to create audit log directory: {}", e))
        })?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DatabaseError::FileIo(format!("Failed to open audit log: {}", e)))?;

        info!("Audit logger initialized: {:?}", path);

        Ok(Self {
            sink: Mutex::new(Sink::File { path, file }),
        })
    }

    /// Create an audit logger that keeps entries in memory
    pub fn in_memory() -> Self {
        Self {
            sink: Mutex::new(Sink::Memory(Vec::new())),
        }
    }

    /// Log an audit event
    pub fn log(&self, event_type: AuditEventType, context: &str) -> Result<()> {
        let severity = Self::severity_for_event(&event_type);

        let entry = AuditEntry {
            timestamp: Utc::now(),
            event_type,
            severity,
            context: context.to_string(),
            pid: std::process::id(),
        };

        let json = serde_json::to_string(&entry).map_err(|e| {
            DatabaseError::Serialization(format!("Failed to serialize audit entry: {}", e))
        })?;

        let mut sink = self.sink.lock().map_err(|_| {
            SyncCoreError::from(DatabaseError::LockPoisoned(
                "Failed to lock audit writer".to_string(),
            ))
        })?;

        match &mut *sink {
            Sink::File { file, .. } => {
                writeln!(file, "{}", json).map_err(|e| {
                    DatabaseError::FileIo(format!("Failed to write audit log: {}", e))
                })?;
                file.flush().map_err(|e| {
                    DatabaseError::FileIo(format!("Failed to flush audit log: {}", e))
                })?;
            }
            Sink::Memory(lines) => lines.push(json),
        }

        Ok(())
    }

    /// Get severity level for an event type (0-5)
    fn severity_for_event(event: &AuditEventType) -> u8 {
        match event {
            AuditEventType::KeyDeleted { .. } | AuditEventType::SnapshotExported { .. } => 5,

            AuditEventType::KeyRotated { .. } => 4,

            AuditEventType::DefaultKeyAutoGenerated { .. }
            | AuditEventType::RecordsReencrypted { .. } => 3,

            AuditEventType::KeyGenerated { .. } | AuditEventType::KeysUnlocked => 2,

            AuditEventType::KeysLocked => 1,
        }
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        let sink = self.sink.lock().map_err(|_| {
            SyncCoreError::from(DatabaseError::LockPoisoned(
                "Failed to lock audit writer".to_string(),
            ))
        })?;

        match &*sink {
            Sink::File { path, .. } => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    DatabaseError::FileIo(format!("Failed to read audit log: {}", e))
                })?;
                Ok(content.lines().map(str::to_string).collect())
            }
            Sink::Memory(lines) => Ok(lines.clone()),
        }
    }

    fn parsed_entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read_lines()?
            .iter()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<AuditEntry>(line).ok())
            .collect())
    }

    /// Most recent entries first
    pub fn get_entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        Ok(self.parsed_entries()?.into_iter().rev().take(limit).collect())
    }

    /// Get audit entries since a specific timestamp
    pub fn get_entries_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditEntry>> {
        Ok(self
            .parsed_entries()?
            .into_iter()
            .filter(|entry| entry.timestamp > since)
            .collect())
    }

    /// Get audit entries by severity level
    pub fn get_entries_by_severity(&self, min_severity: u8) -> Result<Vec<AuditEntry>> {
        Ok(self
            .parsed_entries()?
            .into_iter()
            .filter(|entry| entry.severity >= min_severity)
            .collect())
    }
}

/// Get the default audit log directory
pub fn get_audit_log_dir() -> PathBuf {
    crate::platform::get_data_dir().join("audit")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_levels() {
        assert_eq!(
            AuditLogger::severity_for_event(&AuditEventType::KeyDeleted {
                key_id: "primary".to_string()
            }),
            5
        );
        assert_eq!(
            AuditLogger::severity_for_event(&AuditEventType::KeyRotated {
                key_id: "primary".to_string(),
                archived_as: "primary-archived".to_string(),
            }),
            4
        );
        assert_eq!(
            AuditLogger::severity_for_event(&AuditEventType::DefaultKeyAutoGenerated {
                key_id: "primary".to_string(),
                trigger: "init".to_string(),
            }),
            3
        );
        assert_eq!(
            AuditLogger::severity_for_event(&AuditEventType::KeysLocked),
            1
        );
    }

    #[test]
    fn test_file_sink_appends_and_reads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(tmp.path().to_path_buf()).unwrap();

        logger
            .log(
                AuditEventType::KeyGenerated {
                    key_id: "primary".to_string(),
                    persisted: true,
                },
                "first",
            )
            .unwrap();
        logger.log(AuditEventType::KeysLocked, "second").unwrap();

        assert!(tmp.path().join("audit.log").exists());

        let entries = logger.get_entries(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event_type, AuditEventType::KeysLocked);
        assert_eq!(entries[1].context, "first");
    }

    #[test]
    fn test_memory_sink_filters() {
        let logger = AuditLogger::in_memory();
        let before = Utc::now() - chrono::Duration::seconds(2);

        logger.log(AuditEventType::KeysUnlocked, "info").unwrap();
        logger
            .log(
                AuditEventType::KeyDeleted {
                    key_id: "temp".to_string(),
                },
                "gone",
            )
            .unwrap();

        assert_eq!(logger.get_entries(1).unwrap().len(), 1);
        assert_eq!(logger.get_entries_by_severity(5).unwrap().len(), 1);
        assert_eq!(logger.get_entries_since(before).unwrap().len(), 2);

        let future = Utc::now() + chrono::Duration::seconds(60);
        assert!(logger.get_entries_since(future).unwrap().is_empty());
    }

    #[test]
    fn test_audit_log_dir() {
        assert!(get_audit_log_dir().to_string_lossy().contains("audit"));
    }
}
