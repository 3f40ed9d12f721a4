use super::{byte_state::ReadableByteStreamController, StreamResult};
use crate::platform::MaybeSend;
use std::future::Future;

/// Underlying source of a byte stream.
///
/// `pull` is called whenever the stream wants more bytes. The source either
/// pushes owned chunks with [`ReadableByteStreamController::enqueue`] or fills
/// the buffer of a pending read through
/// [`ReadableByteStreamController::byob_request`].
pub trait ReadableByteSource: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        async { Ok(()) }
    }

    fn pull(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn cancel(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        async { Ok(()) }
    }
}
