use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};

use crate::error::{BuildfarmError, Result};

/// A running build whose merged output is read one line at a time.
#[derive(Debug)]
pub struct BuildProcess {
    child: Child,
    output: BufReader<ChildStdout>,
}

impl BuildProcess {
    pub(crate) fn new(child: Child, stdout: ChildStdout) -> Self {
        Self {
            child,
            output: BufReader::new(stdout),
        }
    }

    /// The next chunk of output ending in `\n` or `\r`, terminator included,
    /// or whatever remains before end of output. `None` once output is done.
    ///
    /// Carriage returns end a line so progress bars reach the client as
    /// they are drawn.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        let mut line = Vec::new();
        loop {
            let buffer = self.output.fill_buf().await?;
            if buffer.is_empty() {
                break;
            }
            match buffer.iter().position(|b| *b == b'\n' || *b == b'\r') {
                Some(end) => {
                    line.extend_from_slice(&buffer[..=end]);
                    self.output.consume(end + 1);
                    break;
                }
                None => {
                    let len = buffer.len();
                    line.extend_from_slice(buffer);
                    self.output.consume(len);
                }
            }
        }

        if line.is_empty() {
            Ok(None)
        } else {
            Ok(Some(String::from_utf8_lossy(&line).into_owned()))
        }
    }

    /// Wait for exit. Returns -1 when the build was killed by a signal.
    pub async fn wait(mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| BuildfarmError::Build(format!("failed to wait for build: {}", e)))?;
        Ok(status.code().unwrap_or(-1))
    }
}
