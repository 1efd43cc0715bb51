//! Accelerated-backend capability probe.
//!
//! The answer is a hint for environment reporting. The engine may be
//! initialized without consulting it.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, info};

use crate::gpu::device::AcceleratorHost;

/// Whether `host` can provide an accelerated compute backend.
///
/// Never fails: a missing interface, a failed negotiation, an adapter request
/// resolving to nothing, or a panic inside the host all come back as `false`.
pub async fn check_accelerated_backend(host: &dyn AcceleratorHost) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| host.has_interface())) {
        Ok(true) => {}
        Ok(false) => {
            debug!("No compute-acceleration interface exposed");
            return false;
        }
        Err(_) => {
            debug!("Interface check panicked");
            return false;
        }
    }

    match AssertUnwindSafe(host.request_adapter()).catch_unwind().await {
        Ok(Ok(Some(adapter))) => {
            info!(name = adapter.name, backend = adapter.backend, "Accelerated backend available");
            true
        }
        Ok(Ok(None)) => {
            debug!("Adapter request resolved to none");
            false
        }
        Ok(Err(e)) => {
            debug!("Adapter negotiation failed: {e}");
            false
        }
        Err(_) => {
            debug!("Adapter negotiation panicked");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::{AdapterInfo, ProbeError};
    use async_trait::async_trait;

    enum Behaviour {
        NoInterface,
        InterfacePanics,
        Adapter,
        NoAdapter,
        Fails,
        Panics,
    }

    struct FakeHost(Behaviour);

    #[async_trait]
    impl AcceleratorHost for FakeHost {
        fn has_interface(&self) -> bool {
            match self.0 {
                Behaviour::NoInterface => false,
                Behaviour::InterfacePanics => panic!("interface enumeration crashed"),
                _ => true,
            }
        }

        async fn request_adapter(&self) -> Result<Option<AdapterInfo>, ProbeError> {
            match self.0 {
                Behaviour::NoInterface | Behaviour::InterfacePanics => {
                    unreachable!("probe must not negotiate without an interface")
                }
                Behaviour::Adapter => Ok(Some(AdapterInfo {
                    name: "fake".to_string(),
                    backend: "test".to_string(),
                })),
                Behaviour::NoAdapter => Ok(None),
                Behaviour::Fails => Err(ProbeError::CapabilityUnavailable("denied".to_string())),
                Behaviour::Panics => panic!("driver crashed"),
            }
        }
    }

    #[tokio::test]
    async fn test_probe_outcomes() {
        assert!(check_accelerated_backend(&FakeHost(Behaviour::Adapter)).await);
        assert!(!check_accelerated_backend(&FakeHost(Behaviour::NoInterface)).await);
        assert!(!check_accelerated_backend(&FakeHost(Behaviour::InterfacePanics)).await);
        assert!(!check_accelerated_backend(&FakeHost(Behaviour::NoAdapter)).await);
        assert!(!check_accelerated_backend(&FakeHost(Behaviour::Fails)).await);
        assert!(!check_accelerated_backend(&FakeHost(Behaviour::Panics)).await);
    }
}
