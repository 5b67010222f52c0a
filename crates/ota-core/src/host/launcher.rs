//! Child-process [`ImageLoader`].
//!
//! The active image runs as a child of the daemon. It learns where to reach
//! the RPC listener (to call `Commit`) from `OTA_RPC_ADDR`.

use std::cell::RefCell;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

use ota_config::LauncherSettings;
use tracing::{debug, trace, warn};

use super::{ImageLoader, LoadError};

/// Environment variable carrying the RPC address to the image.
pub const ENV_RPC_ADDR: &str = "OTA_RPC_ADDR";

/// Time a stopped image gets between SIGTERM and SIGKILL.
const SIGTERM_GRACE_MS: u64 = 2000;

/// Starts the active image as a child process.
pub struct ProcessLauncher {
    slot_dir: PathBuf,
    settings: LauncherSettings,
    rpc_addr: Option<String>,
    child: RefCell<Option<Child>>,
}

impl ProcessLauncher {
    pub fn new(slot_dir: impl Into<PathBuf>, settings: LauncherSettings) -> Self {
        ProcessLauncher {
            slot_dir: slot_dir.into(),
            settings,
            rpc_addr: None,
            child: RefCell::new(None),
        }
    }

    /// Advertise the RPC address to launched images.
    pub fn with_rpc_addr(mut self, addr: impl Into<String>) -> Self {
        self.rpc_addr = Some(addr.into());
        self
    }

    /// Stop the running image, if any.
    pub fn stop(&self) {
        if let Some(mut child) = self.child.borrow_mut().take() {
            stop_with_grace(&mut child);
        }
    }

    fn command_for(&self, image: &std::path::Path) -> Command {
        let mut command = match &self.settings.program {
            Some(program) => {
                let mut command = Command::new(program);
                command.args(&self.settings.args).arg(image);
                command
            }
            None => Command::new(image),
        };
        if let Some(addr) = &self.rpc_addr {
            command.env(ENV_RPC_ADDR, addr);
        }
        command.current_dir(&self.slot_dir);
        command
    }
}

impl ImageLoader for ProcessLauncher {
    fn load(&self, name: &str) -> Result<(), LoadError> {
        let image = self.slot_dir.join(name);
        if !image.is_file() {
            return Err(LoadError::NotFound {
                name: name.to_string(),
            });
        }

        #[cfg(unix)]
        if self.settings.program.is_none() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&image, std::fs::Permissions::from_mode(0o755)).map_err(
                |source| LoadError::Spawn {
                    name: name.to_string(),
                    source,
                },
            )?;
        }

        self.stop();
        let child = self
            .command_for(&image)
            .spawn()
            .map_err(|source| LoadError::Spawn {
                name: name.to_string(),
                source,
            })?;
        debug!(pid = child.id(), image = %image.display(), "image started");
        *self.child.borrow_mut() = Some(child);
        Ok(())
    }
}

impl Drop for ProcessLauncher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(unix)]
fn stop_with_grace(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    let pid = child.id() as i32;
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    debug!(pid, "sent SIGTERM to image");

    let deadline = std::time::Instant::now() + Duration::from_millis(SIGTERM_GRACE_MS);
    while std::time::Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => {
                trace!(pid, "image exited after SIGTERM");
                return;
            }
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(e) => {
                warn!(pid, error = %e, "failed to check image status");
                break;
            }
        }
    }

    warn!(pid, "image did not exit after SIGTERM, sending SIGKILL");
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(not(unix))]
fn stop_with_grace(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
