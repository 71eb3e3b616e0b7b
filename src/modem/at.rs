use std::{
    io::{self, BufRead, BufReader, Write},
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serialport::{ClearBuffer, SerialPort};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

const BAUD: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_millis(200);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ModemError {
    #[error("no modem answering on {0}")]
    NotFound(String),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{command} returned {response}")]
    Rejected { command: String, response: String },
    #[error("{command} timed out")]
    Timeout { command: String },
    #[error("AT worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// A command/response channel to the modem.
///
/// Only one logical operation may use the channel at a time, so it is always
/// shared as a [`SharedAtChannel`] and locked for the whole exchange.
#[async_trait]
pub trait AtChannel: Send {
    /// Send `command` and collect response lines up to the final `OK`.
    /// Echo and blank lines are dropped.
    async fn command(&mut self, command: &str, timeout: Duration)
        -> Result<Vec<String>, ModemError>;

    /// Port currently in use, if any
    fn port(&self) -> Option<String>;
}

pub type SharedAtChannel = Arc<Mutex<Box<dyn AtChannel>>>;

pub fn shared(channel: impl AtChannel + 'static) -> SharedAtChannel {
    Arc::new(Mutex::new(Box::new(channel)))
}

/// Is something answering `AT`
pub async fn responsive(channel: &mut dyn AtChannel) -> bool {
    match channel.command("AT", DEFAULT_TIMEOUT).await {
        Ok(_) => true,
        Err(err) => {
            debug!("Modem not responsive: {}", err);
            false
        }
    }
}

/// Serial AT port, opened lazily and reopened after I/O failures
pub struct SerialAtChannel {
    configured: Option<String>,
    path: Option<String>,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialAtChannel {
    /// With no configured port, /dev/ttyUSB0..9 are probed in order
    pub fn new(configured: Option<String>) -> Self {
        Self {
            configured,
            path: None,
            port: None,
        }
    }

    fn candidates(&self) -> Vec<String> {
        match &self.configured {
            Some(port) => vec![port.clone()],
            None => (0..10)
                .map(|i| format!("/dev/ttyUSB{i}"))
                .filter(|p| Path::new(p).exists())
                .collect(),
        }
    }

    async fn open(&mut self) -> Result<Box<dyn SerialPort>, ModemError> {
        let candidates = self.candidates();
        let searched = candidates.join(", ");
        let found = tokio::task::spawn_blocking(move || {
            candidates.into_iter().find_map(|path| match probe(&path) {
                Ok(port) => Some((path, port)),
                Err(err) => {
                    trace!("No modem on {}: {}", path, err);
                    None
                }
            })
        })
        .await?;

        let Some((path, port)) = found else {
            return Err(ModemError::NotFound(searched));
        };
        info!("Modem detected on {}", path);
        self.path = Some(path);
        Ok(port)
    }
}

#[async_trait]
impl AtChannel for SerialAtChannel {
    async fn command(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, ModemError> {
        let port = match self.port.take() {
            Some(port) => port,
            None => self.open().await?,
        };

        let command = command.to_string();
        let (port, result) = tokio::task::spawn_blocking(move || {
            let mut port = port;
            let result = exchange(&mut port, &command, timeout);
            (port, result)
        })
        .await?;

        match result {
            Err(err @ (ModemError::Io(_) | ModemError::Serial(_))) => {
                warn!("AT port failed, will reopen: {}", err);
                self.path = None;
                Err(err)
            }
            other => {
                self.port = Some(port);
                other
            }
        }
    }

    fn port(&self) -> Option<String> {
        self.path.clone()
    }
}

fn probe(path: &str) -> Result<Box<dyn SerialPort>, ModemError> {
    let mut port = serialport::new(path, BAUD).timeout(READ_TIMEOUT).open()?;
    exchange(&mut port, "AT", DEFAULT_TIMEOUT)?;
    Ok(port)
}

fn exchange(
    port: &mut Box<dyn SerialPort>,
    command: &str,
    timeout: Duration,
) -> Result<Vec<String>, ModemError> {
    port.clear(ClearBuffer::All)?;
    port.write_all(format!("{command}\r").as_bytes())?;
    port.flush()?;

    let deadline = std::time::Instant::now() + timeout;
    let mut reader = BufReader::new(port);
    let mut lines = Vec::new();
    let mut buf = String::new();

    while std::time::Instant::now() < deadline {
        match reader.read_line(&mut buf) {
            Ok(_) if !buf.ends_with('\n') => continue,
            Ok(_) => {}
            Err(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                continue
            }
            Err(err) => return Err(err.into()),
        }

        let line = buf.trim().to_string();
        buf.clear();
        match classify(command, &line) {
            Line::Skip => {}
            Line::Done => return Ok(lines),
            Line::Failed => {
                return Err(ModemError::Rejected {
                    command: command.to_string(),
                    response: line,
                })
            }
            Line::Data => lines.push(line),
        }
    }

    Err(ModemError::Timeout {
        command: command.to_string(),
    })
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Skip,
    Done,
    Failed,
    Data,
}

fn classify(command: &str, line: &str) -> Line {
    if line.is_empty() || line == command {
        Line::Skip
    } else if line == "OK" {
        Line::Done
    } else if line.contains("ERROR") {
        Line::Failed
    } else {
        Line::Data
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;

    use parking_lot::Mutex as SyncMutex;

    use super::*;

    /// Scripted modem: answers from a table, records every command
    #[derive(Clone, Default)]
    pub struct FakeModem {
        pub sent: Arc<SyncMutex<Vec<String>>>,
        pub replies: Arc<SyncMutex<HashMap<String, Result<Vec<String>, String>>>>,
        pub dead: bool,
    }

    impl FakeModem {
        pub fn reply(&self, command: &str, lines: &[&str]) {
            self.replies.lock().insert(
                command.to_string(),
                Ok(lines.iter().map(|l| l.to_string()).collect()),
            );
        }

        pub fn reject(&self, command: &str) {
            self.replies
                .lock()
                .insert(command.to_string(), Err("ERROR".to_string()));
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl AtChannel for FakeModem {
        async fn command(
            &mut self,
            command: &str,
            _timeout: Duration,
        ) -> Result<Vec<String>, ModemError> {
            self.sent.lock().push(command.to_string());
            if self.dead {
                return Err(ModemError::NotFound("/dev/ttyUSB2".into()));
            }
            match self.replies.lock().get(command) {
                Some(Ok(lines)) => Ok(lines.clone()),
                Some(Err(response)) => Err(ModemError::Rejected {
                    command: command.to_string(),
                    response: response.clone(),
                }),
                None => Ok(Vec::new()),
            }
        }

        fn port(&self) -> Option<String> {
            Some("/dev/ttyUSB2".into())
        }
    }
}
