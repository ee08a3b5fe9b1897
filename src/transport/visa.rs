//! SCPI through the system VISA library.
//!
//! Wraps `visa-rs`. VISA calls block, so every call runs on Tokio's blocking
//! pool with the instrument behind `Arc<Mutex<..>>`. The VISA I/O timeout
//! (`VI_ATTR_TMO_VALUE`) is set to the timeout of each call before any I/O, and
//! the async side waits a little longer so the driver reports the timeout first.
//! After a timeout the session is closed: a late reply must not be taken as the
//! answer to the next query.
//!
//! Handles USB (`USB0::2391::12345::XY00001234::0::INSTR`), GPIB, VXI-11 and
//! HiSLIP resources, as well as raw sockets if preferred over [`super::TcpTransport`].

use super::ScpiTransport;
use crate::error::{SmuError, SmuResult};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use visa_rs::enums::attribute::AttrTmoValue;
use visa_rs::enums::status::ErrorCode;
use visa_rs::prelude::*;

/// Extra time the async side waits beyond the VISA I/O timeout.
const VISA_TIMEOUT_GRACE: Duration = Duration::from_millis(500);

/// The resource manager has to outlive the instrument session opened from it.
struct VisaSession {
    _rm: DefaultRM,
    instrument: Instrument,
}

type SharedInstrument = Arc<Mutex<Option<VisaSession>>>;

/// VISA-backed transport.
pub struct VisaTransport {
    instrument: SharedInstrument,
    connected: Arc<AtomicBool>,
    resource_name: String,
    timeout: Duration,
    write_terminator: String,
}

fn visa_error(context: &str, err: impl std::fmt::Display) -> SmuError {
    SmuError::Transport(format!("{context}: {err}"))
}

impl VisaTransport {
    /// Open `resource` through the default resource manager.
    pub async fn open(resource: &str, timeout: Duration) -> SmuResult<Self> {
        let resource_cstr = CString::new(resource)
            .map_err(|_| SmuError::Configuration(format!("resource '{resource}' contains NUL")))?;

        let session = tokio::task::spawn_blocking(move || -> SmuResult<VisaSession> {
            let rm = DefaultRM::new()
                .map_err(|e| visa_error("failed to create VISA resource manager", e))?;
            let instrument = rm
                .open(&resource_cstr.into(), AccessMode::NO_LOCK, timeout)
                .map_err(|e| visa_error("failed to open VISA resource", e))?;
            Ok(VisaSession { _rm: rm, instrument })
        })
        .await
        .map_err(|e| visa_error("VISA open task failed", e))??;

        tracing::info!(resource = %resource, "Opened VISA resource");

        Ok(Self {
            instrument: Arc::new(Mutex::new(Some(session))),
            connected: Arc::new(AtomicBool::new(true)),
            resource_name: resource.to_string(),
            timeout,
            write_terminator: "\n".to_string(),
        })
    }

    pub fn with_write_terminator(mut self, terminator: &str) -> Self {
        self.write_terminator = terminator.to_string();
        self
    }

    /// Run `op` against the open instrument on the blocking pool, with the VISA
    /// I/O timeout set to `timeout`.
    async fn run_blocking<T, F>(&self, command: &str, timeout: Duration, op: F) -> SmuResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Instrument) -> io::Result<T> + Send + 'static,
    {
        let instrument = Arc::clone(&self.instrument);
        let timed_out = || SmuError::Timeout {
            command: command.to_string(),
            timeout,
        };

        let task = tokio::task::spawn_blocking(move || -> SmuResult<io::Result<T>> {
            let guard = instrument.blocking_lock();
            let session = guard.as_ref().ok_or(SmuError::NotConnected)?;
            set_io_timeout(&session.instrument, timeout)?;
            Ok(op(&session.instrument))
        });

        let result = match tokio::time::timeout(timeout + VISA_TIMEOUT_GRACE, task).await {
            Ok(Ok(Ok(Ok(value)))) => return Ok(value),
            Ok(Ok(Ok(Err(e)))) if is_visa_timeout(&e) => Err(timed_out()),
            Ok(Ok(Ok(Err(e)))) => Err(SmuError::Io(e)),
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(e)) => Err(visa_error("VISA I/O task failed", e)),
            Err(_) => Err(timed_out()),
        };

        if matches!(result, Err(SmuError::Timeout { .. })) {
            tracing::warn!(
                resource = %self.resource_name,
                command = %command,
                "VISA timeout, closing session"
            );
            self.close().await?;
        }
        result
    }
}

fn set_io_timeout(instrument: &Instrument, timeout: Duration) -> SmuResult<()> {
    let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
    let attr = AttrTmoValue::new_checked(millis)
        .ok_or_else(|| SmuError::InvalidArgument(format!("VISA timeout {timeout:?} out of range")))?;
    instrument
        .set_attr(attr)
        .map_err(|e| visa_error("failed to set VISA timeout", e))
}

/// Whether an I/O error carries the VISA `VI_ERROR_TMO` status.
fn is_visa_timeout(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
        || err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<visa_rs::Error>())
            .is_some_and(|visa| visa.0 == ErrorCode::ErrorTmo)
}

#[async_trait]
impl ScpiTransport for VisaTransport {
    async fn write(&self, command: &str) -> SmuResult<()> {
        if !self.is_connected() {
            return Err(SmuError::NotConnected);
        }
        let line = format!("{command}{}", self.write_terminator);
        tracing::debug!("VISA write: {:?}", command);

        self.run_blocking(command, self.timeout, move |mut instr| {
            instr.write_all(line.as_bytes())
        })
        .await
    }

    async fn query_with_timeout(&self, command: &str, timeout: Duration) -> SmuResult<String> {
        if !self.is_connected() {
            return Err(SmuError::NotConnected);
        }
        let line = format!("{command}{}", self.write_terminator);
        tracing::debug!("VISA query: {:?}", command);

        let reply = self
            .run_blocking(command, timeout, move |mut instr| {
                instr.write_all(line.as_bytes())?;
                let mut response = String::new();
                BufReader::new(instr).read_line(&mut response)?;
                Ok(response)
            })
            .await?;

        let trimmed = reply.trim().to_string();
        tracing::debug!("VISA response: {:?}", trimmed);
        Ok(trimmed)
    }

    async fn close(&self) -> SmuResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut guard = self.instrument.lock().await;
        if guard.take().is_some() {
            tracing::info!(resource = %self.resource_name, "VISA resource closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
