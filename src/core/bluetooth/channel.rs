//! The open byte channel to a printer.

use log::{debug, warn};

use crate::core::bluetooth::backend::Link;
use crate::core::bluetooth::error::PrinterError;

/// Writable channel owned by the connection session
pub struct ChannelHandle {
    identifier: String,
    link: Box<dyn Link>,
    closed: bool,
}

impl ChannelHandle {
    pub fn new(identifier: impl Into<String>, link: Box<dyn Link>) -> Self {
        Self {
            identifier: identifier.into(),
            link,
            closed: false,
        }
    }

    /// Identifier of the device at the other end
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_live(&self) -> bool {
        !self.closed && self.link.is_live()
    }

    /// Sends raw bytes to the printer
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), PrinterError> {
        if !self.is_live() {
            return Err(PrinterError::NotConnected);
        }
        self.link
            .write(bytes)
            .await
            .map_err(|e| PrinterError::WriteFailed(e.to_string()))?;
        debug!("Wrote {} bytes to {}", bytes.len(), self.identifier);
        Ok(())
    }

    /// Closes the channel, reporting a failure of the underlying transport.
    /// Closing an already closed channel succeeds.
    pub async fn try_close(&mut self) -> Result<(), PrinterError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.link
            .close()
            .await
            .map_err(|e| PrinterError::DisconnectFailed(e.to_string()))
    }

    /// Closes the channel. Transport errors are logged, never returned.
    pub async fn close(&mut self) {
        if let Err(e) = self.try_close().await {
            warn!("Error closing channel to {}: {}", self.identifier, e);
        }
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("identifier", &self.identifier)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use anyhow::{Result, anyhow};
    use async_trait::async_trait;

    #[derive(Default)]
    struct FlakyLink {
        closes: Arc<AtomicUsize>,
        gone: AtomicBool,
    }

    #[async_trait]
    impl Link for FlakyLink {
        async fn bind_channel(&mut self) -> Result<(), PrinterError> {
            Ok(())
        }

        async fn write(&mut self, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.gone.store(true, Ordering::SeqCst);
            Err(anyhow!("socket already closed"))
        }

        fn is_live(&self) -> bool {
            !self.gone.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_close_swallows_errors_and_is_idempotent() {
        let closes = Arc::new(AtomicUsize::new(0));
        let link = FlakyLink {
            closes: closes.clone(),
            ..Default::default()
        };
        let mut channel = ChannelHandle::new("AA:BB:CC:DD:EE:FF", Box::new(link));
        assert!(channel.is_live());

        channel.close().await;
        channel.close().await;

        assert!(!channel.is_live());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_try_close_reports_disconnect_failure_once() {
        let mut channel = ChannelHandle::new("id", Box::new(FlakyLink::default()));
        let err = channel.try_close().await.unwrap_err();
        assert_eq!(err.code(), "DISCONNECT_FAILED");
        assert!(channel.try_close().await.is_ok());
    }

    #[tokio::test]
    async fn test_write_after_close_is_rejected() {
        let mut channel = ChannelHandle::new("id", Box::new(FlakyLink::default()));
        assert!(channel.write(b"hello").await.is_ok());
        channel.close().await;
        assert_eq!(
            channel.write(b"hello").await.unwrap_err(),
            PrinterError::NotConnected
        );
    }
}
