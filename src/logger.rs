use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;

/// Audit trail of server-side events. Every hook defaults to a no-op.
pub trait AuditLogger: Send + Sync {
    fn session_started(&self, _peer: SocketAddr, _login: &str) {}
    fn session_ended(&self, _peer: SocketAddr, _login: &str) {}
    fn user_created(&self, _login: &str) {}
    fn user_removed(&self, _login: &str) {}
    fn banned(&self, _address: SocketAddr) {}
    fn stored(&self, _login: &str, _path: &Path, _bytes: u64) {}
    fn sent(&self, _login: &str, _path: &Path, _bytes: u64) {}
    fn moved(&self, _login: &str, _from: &Path, _to: &Path) {}
    fn error(&self, _context: &str, _peer: SocketAddr, _msg: &str) {}
}

pub struct NoopLogger;
impl AuditLogger for NoopLogger {}

/// Appends one timestamped line per event to a file.
pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl AuditLogger for TextLogger {
    fn session_started(&self, peer: SocketAddr, login: &str) {
        self.line(&format!("SESSION_START peer={peer} login={login}"));
    }
    fn session_ended(&self, peer: SocketAddr, login: &str) {
        self.line(&format!("SESSION_END peer={peer} login={login}"));
    }
    fn user_created(&self, login: &str) {
        self.line(&format!("USER_CREATED login={login}"));
    }
    fn user_removed(&self, login: &str) {
        self.line(&format!("USER_REMOVED login={login}"));
    }
    fn banned(&self, address: SocketAddr) {
        self.line(&format!("BAN address={address}"));
    }
    fn stored(&self, login: &str, path: &Path, bytes: u64) {
        self.line(&format!("UPLOAD login={login} path={} bytes={bytes}", path.display()));
    }
    fn sent(&self, login: &str, path: &Path, bytes: u64) {
        self.line(&format!("DOWNLOAD login={login} path={} bytes={bytes}", path.display()));
    }
    fn moved(&self, login: &str, from: &Path, to: &Path) {
        self.line(&format!(
            "MOVE login={login} from={} to={}",
            from.display(),
            to.display()
        ));
    }
    fn error(&self, context: &str, peer: SocketAddr, msg: &str) {
        self.line(&format!("ERROR ctx={context} peer={peer} msg={msg}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_logger_appends_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs/audit.log");
        let logger = TextLogger::new(&path).unwrap();
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        logger.user_created("alice");
        logger.session_started(peer, "alice");
        logger.stored("alice", Path::new("/srv/alice/a.txt"), 12);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("USER_CREATED login=alice"));
        assert!(lines[1].contains("SESSION_START peer=127.0.0.1:4000 login=alice"));
        assert!(lines[2].contains("bytes=12"));
        assert!(lines.iter().all(|l| l.starts_with('[')));
    }
}
