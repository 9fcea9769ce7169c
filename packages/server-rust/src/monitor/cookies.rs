//! Durable marker files under the node data directory.

use std::path::PathBuf;

use repman_core::Cookie;
use tracing::debug;

use super::ServerMonitor;
use crate::error::MonitorError;
use crate::logging::MONITOR;

fn cookie_error(path: &std::path::Path, source: std::io::Error) -> MonitorError {
    MonitorError::Cookie {
        path: path.display().to_string(),
        source,
    }
}

impl ServerMonitor {
    fn cookie_path(&self, cookie: Cookie) -> PathBuf {
        self.data_dir().join(cookie.file_name())
    }

    /// Creates the marker. Setting a present cookie is a no-op.
    ///
    /// # Errors
    ///
    /// [`MonitorError::Cookie`] when the directory or file cannot be created.
    pub async fn set_cookie(&self, cookie: Cookie) -> Result<(), MonitorError> {
        let path = self.cookie_path(cookie);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        let dir = self.data_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| cookie_error(&dir, e))?;
        tokio::fs::write(&path, b"")
            .await
            .map_err(|e| cookie_error(&path, e))?;
        debug!(target: MONITOR, server = %self.url, cookie = cookie.file_name(), "cookie set");
        Ok(())
    }

    pub async fn has_cookie(&self, cookie: Cookie) -> bool {
        tokio::fs::try_exists(self.cookie_path(cookie)).await.unwrap_or(false)
    }

    /// Removes the marker. Removing an absent cookie is a no-op.
    ///
    /// # Errors
    ///
    /// [`MonitorError::Cookie`] on any I/O error other than not-found.
    pub async fn del_cookie(&self, cookie: Cookie) -> Result<(), MonitorError> {
        let path = self.cookie_path(cookie);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(cookie_error(&path, e)),
        }
    }

    /// Cookies currently present.
    pub async fn cookies(&self) -> Vec<Cookie> {
        let mut out = Vec::new();
        for cookie in Cookie::ALL {
            if self.has_cookie(cookie).await {
                out.push(cookie);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::context;
    use super::*;
    use crate::db::fake::FakeFleet;

    #[tokio::test]
    async fn cookies_are_idempotent_markers() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FakeFleet::new();
        let a = fleet.add_mariadb("a", 3306, 1);
        let m = ServerMonitor::new(context(&fleet, dir.path(), |_| {}), &a);
        assert!(m.cookies().await.is_empty());
        m.set_cookie(Cookie::WaitBackup).await.unwrap();
        m.set_cookie(Cookie::WaitBackup).await.unwrap();
        m.set_cookie(Cookie::PhysicalBackup).await.unwrap();
        assert_eq!(m.cookies().await, vec![Cookie::WaitBackup, Cookie::PhysicalBackup]);
        assert!(m.data_dir().join("cookie_waitbackup").exists());
        m.del_cookie(Cookie::WaitBackup).await.unwrap();
        m.del_cookie(Cookie::WaitBackup).await.unwrap();
        assert!(!m.has_cookie(Cookie::WaitBackup).await);
    }
}
