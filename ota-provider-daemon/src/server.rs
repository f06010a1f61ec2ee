//! TCP listener, one session task per connection

use log::{info, warn};
use ota_provider::ProviderHandle;
use tokio::net::TcpListener;

use crate::session::Session;

pub struct Server {
    listener: TcpListener,
    provider: ProviderHandle,
}

impl Server {
    pub async fn bind(addr: &str, provider: ProviderHandle) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("OTA provider listening on {}", listener.local_addr()?);
        Ok(Self { listener, provider })
    }

    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let provider = self.provider.clone();

            tokio::spawn(async move {
                info!("connection from {peer}");
                let session = Session::new(stream, provider, peer);
                if let Err(e) = session.run().await {
                    warn!("session error with {peer}: {e}");
                }
                info!("connection closed: {peer}");
            });
        }
    }
}
