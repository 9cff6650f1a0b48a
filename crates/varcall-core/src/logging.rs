//! 構造化ログ
//!
//! 人間向けの進捗は `log` マクロで出し、機械処理向けのイベントは
//! 1行1 JSON で `summary_log` に追記する。

use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};

/// JSONL イベントの出力先
pub struct StructuredLogger {
    pub to_stdout: bool,
    file: Option<Mutex<BufWriter<File>>>,
    write_failed: AtomicBool,
}

impl StructuredLogger {
    /// `"-"` なら stdout、それ以外はファイルへ追記
    pub fn new(path: &str) -> io::Result<Self> {
        if path == "-" {
            return Ok(Self {
                to_stdout: true,
                file: None,
                write_failed: AtomicBool::new(false),
            });
        }
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)?;
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            to_stdout: false,
            file: Some(Mutex::new(BufWriter::with_capacity(1 << 16, f))),
            write_failed: AtomicBool::new(false),
        })
    }

    pub fn write_json(&self, v: &Value) {
        if self.to_stdout {
            println!("{v}");
        } else if let Some(ref file) = self.file {
            match file.lock() {
                Ok(mut w) => {
                    if let Err(e) = writeln!(w, "{v}") {
                        self.report_failure(&e);
                    }
                }
                Err(e) => self.report_failure(&e),
            }
        }
    }

    /// 書き込み失敗は最初の1回だけ警告する
    fn report_failure(&self, err: &dyn Display) {
        if !self.write_failed.swap(true, Ordering::Relaxed) {
            log::warn!("failed to write summary log: {err}");
        }
    }

    /// これまでに書き込みが失敗したか
    pub fn has_failed(&self) -> bool {
        self.write_failed.load(Ordering::Relaxed)
    }

    /// `event` フィールドを付けて出力
    pub fn event(&self, event: &str, mut fields: Value) {
        if let Value::Object(ref mut map) = fields {
            map.insert("event".to_string(), json!(event));
            map.insert("ts".to_string(), json!(chrono::Utc::now().to_rfc3339()));
        }
        self.write_json(&fields);
    }

    pub fn flush(&self) -> io::Result<()> {
        let Some(ref file) = self.file else {
            return Ok(());
        };
        let result = match file.lock() {
            Ok(mut w) => w.flush(),
            Err(_) => Err(io::Error::other("summary log lock poisoned")),
        };
        if let Err(ref e) = result {
            self.report_failure(e);
        }
        result
    }
}

impl Drop for StructuredLogger {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_appended_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/summary.jsonl");
        let path_str = path.to_str().unwrap();
        {
            let logger = StructuredLogger::new(path_str).unwrap();
            assert!(!logger.to_stdout);
            logger.event("epoch", json!({"epoch": 1, "validation_loss": 0.5}));
            logger.event("decay", json!({"epoch": 7}));
            logger.flush().unwrap();
        }
        {
            let logger = StructuredLogger::new(path_str).unwrap();
            logger.event("epoch", json!({"epoch": 8}));
        }

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "epoch");
        assert_eq!(lines[0]["epoch"], 1);
        assert_eq!(lines[1]["event"], "decay");
        assert_eq!(lines[2]["epoch"], 8);
        assert!(lines[2]["ts"].is_string());
    }

    #[test]
    fn test_stdout_mode() {
        let logger = StructuredLogger::new("-").unwrap();
        assert!(logger.to_stdout);
        assert!(logger.flush().is_ok());
        assert!(!logger.has_failed());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_write_failure_is_reported() {
        if !Path::new("/dev/full").exists() {
            return;
        }
        let logger = StructuredLogger::new("/dev/full").unwrap();
        logger.event("epoch", json!({"epoch": 1}));
        assert!(!logger.has_failed());
        assert!(logger.flush().is_err());
        assert!(logger.has_failed());
    }

    #[test]
    fn test_poisoned_lock_fails_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.jsonl");
        let logger = StructuredLogger::new(path.to_str().unwrap()).unwrap();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = logger.file.as_ref().unwrap().lock().unwrap();
            panic!("poison");
        }));
        assert!(logger.flush().is_err());
        assert!(logger.has_failed());
        logger.event("epoch", json!({"epoch": 2}));
    }
}
