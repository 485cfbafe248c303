pub mod stream;

pub use stream::StreamEndpoint;

use async_trait::async_trait;
use std::sync::Arc;

/// Consumer of decrypted envelope bytes.
///
/// The reader task of every stream endpoint hands each record's
/// plaintext here together with the endpoint it arrived on. The server
/// implementation learns routes from Pings and writes Packets to the
/// TUN device; the client implementation writes Packets and ignores
/// Pings. Implementations must not block on anything that could in turn
/// wait on this endpoint's reader.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn on_envelope(&self, data: &[u8], from: &Arc<StreamEndpoint>);
}
