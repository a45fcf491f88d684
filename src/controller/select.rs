//! Backend selection at startup

use std::sync::Arc;

use super::{BackendKind, NativeController, NativeInvoker, SocketController, VolumeController};
use crate::config::AppConfig;
use crate::network::Dialer;
use crate::updates::UpdateHub;

/// Native when the host offers an invocation channel, socket otherwise
pub fn backend_for(native_available: bool) -> BackendKind {
    if native_available {
        BackendKind::Native
    } else {
        BackendKind::Socket
    }
}

/// Build the controller for this host. Called once; the result is shared for
/// the lifetime of the process.
pub fn select_backend(
    native: Option<Arc<dyn NativeInvoker>>,
    dialer: Arc<dyn Dialer>,
    hub: UpdateHub,
    config: &AppConfig,
) -> Arc<dyn VolumeController> {
    let kind = backend_for(native.is_some());
    tracing::info!("Using {} volume backend", kind);

    match native {
        Some(invoker) => Arc::new(NativeController::new(invoker)),
        None => Arc::new(SocketController::new(dialer, hub, config)),
    }
}
