use async_trait::async_trait;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};

use crate::session::ChannelControl;

/// SSH extended data type code for stderr.
const EXTENDED_DATA_STDERR: u32 = 1;

/// [`ChannelControl`] over a russh server session handle.
#[derive(Clone)]
pub struct RusshChannel {
    handle: Handle,
    id: ChannelId,
}

impl RusshChannel {
    pub fn new(handle: Handle, id: ChannelId) -> Self {
        Self { handle, id }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }
}

#[async_trait]
impl ChannelControl for RusshChannel {
    /// An empty data packet: harmless to the peer, but fails once the transport is gone.
    async fn keepalive(&self) -> anyhow::Result<()> {
        self.handle
            .data(self.id, CryptoVec::new())
            .await
            .map_err(|_| anyhow::anyhow!("transport closed"))
    }

    async fn write_stderr(&self, data: &[u8]) -> anyhow::Result<()> {
        self.handle
            .extended_data(self.id, EXTENDED_DATA_STDERR, CryptoVec::from_slice(data))
            .await
            .map_err(|_| anyhow::anyhow!("transport closed"))
    }

    async fn exit_status(&self, code: u32) -> anyhow::Result<()> {
        self.handle
            .exit_status_request(self.id, code)
            .await
            .map_err(|_| anyhow::anyhow!("transport closed"))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.handle
            .eof(self.id)
            .await
            .map_err(|_| anyhow::anyhow!("transport closed"))?;
        self.handle
            .close(self.id)
            .await
            .map_err(|_| anyhow::anyhow!("transport closed"))
    }
}
