//! External command opener
//!
//! Runs a shell command once per shard and treats its standard output as
//! the shard's bytes. Used for decompression or custom fetch pipelines.

use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, Stdio};

use shard_core::{Error, Result};
use tracing::{debug, instrument, warn};

use crate::{ShardOpener, ShardStream};

/// Placeholder replaced by the shard URL
pub const URL_PLACEHOLDER: &str = "{}";

/// Spawns `sh -c <template>` with `{}` bound to the shard URL
#[derive(Debug, Clone)]
pub struct ProcessOpener {
    template: String,
}

impl ProcessOpener {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// The shell command run for `url`
    pub fn command_for(&self, url: &str) -> String {
        self.template.replace(URL_PLACEHOLDER, url)
    }
}

impl ShardOpener for ProcessOpener {
    #[instrument(skip(self), fields(opener = "pipe"))]
    fn open(&self, url: &str) -> Result<ShardStream> {
        let command = self.command_for(url);
        debug!(%command, "Spawning shard pipeline");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::open(url, format!("failed to spawn '{}': {}", command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::open(url, "child has no stdout"))?;

        Ok(Box::new(ProcessStream {
            command,
            child,
            stdout,
            finished: false,
        }))
    }

    fn name(&self) -> &'static str {
        "pipe"
    }
}

/// Standard output of a running command.
///
/// End of output waits for the child; a non-zero exit turns that final read
/// into an error. Dropping the stream early kills the child.
struct ProcessStream {
    command: String,
    child: Child,
    stdout: ChildStdout,
    finished: bool,
}

impl Read for ProcessStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished {
            return Ok(0);
        }

        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.finished = true;
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("command '{}' exited with {}", self.command, status),
                ));
            }
        }
        Ok(n)
    }
}

impl Drop for ProcessStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.child.kill() {
            // Already exited on its own
            debug!(command = %self.command, error = %e, "Kill on drop failed");
        }
        if let Err(e) = self.child.wait() {
            warn!(command = %self.command, error = %e, "Failed to reap shard pipeline");
        }
    }
}
