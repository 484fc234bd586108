/*!
 * Link encryption service.
 */
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::info;

use inkdev_core::types::Value;

use super::{RunState, ServiceContext};
use crate::error::{DeviceError, Result};
use crate::link::Command;

#[derive(Debug)]
struct EncryptionInner {
    ctx: ServiceContext,
    state: RunState,
    cipher_suite: RwLock<Option<String>>,
}

/// Negotiate and drop link encryption
#[derive(Debug, Clone)]
pub struct EncryptionService {
    inner: Arc<EncryptionInner>,
}

impl EncryptionService {
    pub(crate) fn new(ctx: ServiceContext) -> Self {
        Self {
            inner: Arc::new(EncryptionInner {
                ctx,
                state: RunState::default(),
                cipher_suite: RwLock::new(None),
            }),
        }
    }

    /// Whether encryption is active
    pub fn is_started(&self) -> bool {
        self.inner.state.is_started()
    }

    /// Negotiated cipher suite, while started
    pub fn cipher_suite(&self) -> Option<String> {
        self.inner.cipher_suite.read().ok().and_then(|s| s.clone())
    }

    fn set_cipher_suite(&self, suite: Option<String>) {
        match self.inner.cipher_suite.write() {
            Ok(mut s) => *s = suite,
            Err(poisoned) => *poisoned.into_inner() = suite,
        }
    }

    /// Start encryption and return the negotiated cipher suite
    pub async fn start(&self, cancel: &CancellationToken) -> Result<String> {
        let inner = &self.inner;
        let suite = inner
            .state
            .start("Encryption", || async {
                match inner.ctx.execute(Command::StartEncryption, cancel).await? {
                    Value::String(suite) => Ok(suite),
                    other => Err(DeviceError::protocol(format!(
                        "expected cipher suite, device answered {}",
                        other.kind()
                    ))),
                }
            })
            .await?;
        self.set_cipher_suite(Some(suite.clone()));
        info!("{}: encryption started ({})", inner.ctx.device_id, suite);
        Ok(suite)
    }

    /// Stop encryption
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        inner
            .state
            .stop("Encryption", || async {
                inner.ctx.execute(Command::StopEncryption, cancel).await?;
                Ok(())
            })
            .await?;
        self.set_cipher_suite(None);
        info!("{}: encryption stopped", inner.ctx.device_id);
        Ok(())
    }

    pub(crate) async fn shutdown(&self) -> Result<()> {
        if self.inner.state.force_stopped() {
            self.set_cipher_suite(None);
            self.inner.ctx.execute_on_close(Command::StopEncryption).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DeviceDescriptor, DeviceModel, TransportKind};
    use crate::device::InkDevice;
    use crate::link::ServiceProfile;
    use crate::status::DeviceStatus;
    use crate::transports::sim::{SimulatedDevice, SIM_CIPHER_SUITE};
    use inkdev_core::config::FileTransferConfig;

    #[tokio::test]
    async fn test_encryption_lifecycle_and_close() {
        let descriptor = DeviceDescriptor::new("stu-2", "STU-430", TransportKind::Usb, DeviceModel::Stu);
        let (link, ctl) = SimulatedDevice::new(descriptor)
            .with_service(ServiceProfile::Encryption)
            .open_link();
        let events = link.take_events().unwrap();
        let device =
            InkDevice::attach(link, events, DeviceStatus::Idle, &FileTransferConfig::default()).unwrap();
        let encryption = device.encryption().unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(encryption.cipher_suite(), None);
        assert_eq!(encryption.start(&cancel).await.unwrap(), SIM_CIPHER_SUITE);
        assert!(encryption.is_started());
        assert_eq!(encryption.cipher_suite().as_deref(), Some(SIM_CIPHER_SUITE));
        assert!(matches!(encryption.start(&cancel).await, Err(DeviceError::InvalidState(_))));

        device.close().await.unwrap();
        assert!(!encryption.is_started());
        assert_eq!(encryption.cipher_suite(), None);
        assert_eq!(ctl.commands(), vec![Command::StartEncryption, Command::StopEncryption]);
        assert_eq!(ctl.close_count(), 1);
    }
}
