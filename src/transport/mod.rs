//! SCPI transports.
//!
//! A transport moves command lines to the instrument and reply lines back. It
//! knows nothing about the B2900 command set; that lives in [`crate::scpi`] and
//! [`crate::smu`].
//!
//! - [`TcpTransport`]: raw SCPI socket (`TCPIP0::host::5025::SOCKET`), no VISA needed.
//! - [`VisaTransport`]: any resource the system VISA library can open
//!   (requires the `instrument_visa` feature).
//! - [`MockTransport`]: simulated B2902B for tests and dry runs.

pub mod mock;
pub mod tcp;
#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use mock::MockTransport;
pub use tcp::TcpTransport;
#[cfg(feature = "instrument_visa")]
pub use visa::VisaTransport;

use crate::config::{ConnectionConfig, TransportKind};
use crate::error::{SmuError, SmuResult};
use crate::resource::ResourceAddress;
use async_trait::async_trait;
use std::time::Duration;

/// Line-oriented SCPI transport.
///
/// Implementations serialize access internally; one command or query is in
/// flight at a time. Errors are reported as-is, nothing is retried.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send one command line without reading a reply.
    async fn write(&self, command: &str) -> SmuResult<()>;

    /// Send one command line and read one reply line (trimmed).
    async fn query(&self, command: &str) -> SmuResult<String> {
        self.query_with_timeout(command, self.timeout()).await
    }

    /// Like [`query`](Self::query) with an explicit reply timeout.
    async fn query_with_timeout(&self, command: &str, timeout: Duration) -> SmuResult<String>;

    /// Release the underlying handle. Later calls fail with `NotConnected`.
    async fn close(&self) -> SmuResult<()>;

    fn is_connected(&self) -> bool;

    /// Resource string the transport was opened on.
    fn resource_name(&self) -> &str;

    /// Default reply timeout.
    fn timeout(&self) -> Duration;
}

/// Open the transport described by `config`.
///
/// With [`TransportKind::Auto`] the resource string decides: a `::SOCKET`
/// resource uses [`TcpTransport`], anything else goes through VISA.
pub async fn connect(config: &ConnectionConfig) -> SmuResult<Box<dyn ScpiTransport>> {
    let kind = match config.transport {
        TransportKind::Auto => {
            let address: ResourceAddress = config.resource.parse()?;
            if address.is_raw_socket() {
                TransportKind::Tcp
            } else {
                TransportKind::Visa
            }
        }
        other => other,
    };

    match kind {
        TransportKind::Tcp => {
            let transport = TcpTransport::connect_resource(
                &config.resource,
                config.connect_timeout(),
                config.timeout(),
            )
            .await?
            .with_write_terminator(&config.write_terminator);
            Ok(Box::new(transport))
        }
        TransportKind::Visa => open_visa(config).await,
        TransportKind::Mock => Ok(Box::new(
            MockTransport::new().with_resource_name(&config.resource),
        )),
        TransportKind::Auto => Err(SmuError::Configuration(
            "transport kind could not be resolved".into(),
        )),
    }
}

#[cfg(feature = "instrument_visa")]
async fn open_visa(config: &ConnectionConfig) -> SmuResult<Box<dyn ScpiTransport>> {
    let transport = VisaTransport::open(&config.resource, config.timeout())
        .await?
        .with_write_terminator(&config.write_terminator);
    Ok(Box::new(transport))
}

#[cfg(not(feature = "instrument_visa"))]
async fn open_visa(config: &ConnectionConfig) -> SmuResult<Box<dyn ScpiTransport>> {
    tracing::error!(
        resource = %config.resource,
        "resource needs a VISA library but VISA support is compiled out"
    );
    Err(SmuError::FeatureNotEnabled("instrument_visa".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_mock() {
        let config = ConnectionConfig {
            resource: "MOCK0::B2902B::INSTR".into(),
            transport: TransportKind::Mock,
            ..ConnectionConfig::default()
        };
        let transport = connect(&config).await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(transport.resource_name(), "MOCK0::B2902B::INSTR");
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_auto_usb_without_visa_feature() {
        let config = ConnectionConfig {
            resource: "USB0::2391::12345::XY00001234::0::INSTR".into(),
            transport: TransportKind::Auto,
            ..ConnectionConfig::default()
        };
        match connect(&config).await {
            Err(SmuError::FeatureNotEnabled(feature)) => assert_eq!(feature, "instrument_visa"),
            other => panic!("unexpected result: {:?}", other.map(|t| t.resource_name().to_string())),
        }
    }

    #[tokio::test]
    async fn test_auto_rejects_malformed_resource() {
        let config = ConnectionConfig {
            resource: "not a resource".into(),
            transport: TransportKind::Auto,
            ..ConnectionConfig::default()
        };
        assert!(matches!(
            connect(&config).await,
            Err(SmuError::Configuration(_))
        ));
    }
}
