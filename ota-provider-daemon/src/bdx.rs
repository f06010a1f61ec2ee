//! Single-slot BDX transfer bookkeeping
//!
//! Tracks the one transfer the provider may have open. Bytes are not pumped
//! here; a claimed slot is released when its transfer timeout runs out.

use std::time::Duration;

use log::{debug, info, warn};
use ota_proto::{FabricIndex, NodeId};
use ota_provider::{BdxCoordinator, BdxError, TransferParams};
use tokio::time::Instant;

#[derive(Debug)]
struct ActiveTransfer {
    fabric_index: FabricIndex,
    node_id: NodeId,
    claimed_at: Instant,
    timeout: Duration,
    source: Option<(String, u64)>,
    prepared: bool,
}

#[derive(Debug, Default)]
pub struct TransferSlot {
    registered: bool,
    active: Option<ActiveTransfer>,
}

impl TransferSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn expire(&mut self) {
        if let Some(active) = &self.active {
            if active.claimed_at.elapsed() >= active.timeout {
                info!(
                    "BDX transfer to {}:{:016X} timed out",
                    active.fabric_index, active.node_id
                );
                self.active = None;
            }
        }
    }
}

impl BdxCoordinator for TransferSlot {
    fn register_sender_handler(&mut self) -> Result<(), BdxError> {
        if !self.registered {
            debug!("BDX sender handler registered");
        }
        self.registered = true;
        Ok(())
    }

    fn initialize_transfer(&mut self, fabric_index: FabricIndex, node_id: NodeId) -> Result<(), BdxError> {
        if !self.registered {
            return Err(BdxError::NotInitialized);
        }
        self.expire();
        if self.active.is_some() {
            return Err(BdxError::Busy);
        }

        self.active = Some(ActiveTransfer {
            fabric_index,
            node_id,
            claimed_at: Instant::now(),
            timeout: TransferParams::default().timeout,
            source: None,
            prepared: false,
        });
        Ok(())
    }

    fn set_image_source_url(&mut self, url: &str, size: u64) {
        match &mut self.active {
            Some(active) => active.source = Some((url.to_string(), size)),
            None => warn!("image source {url} set with no transfer claimed"),
        }
    }

    fn prepare_for_transfer(&mut self, params: &TransferParams) -> Result<(), BdxError> {
        let Some(active) = self.active.as_mut() else {
            return Err(BdxError::NotInitialized);
        };
        let Some((url, size)) = active.source.clone() else {
            self.active = None;
            return Err(BdxError::Setup("no image source".to_string()));
        };

        info!(
            "BDX {:?} for {}:{:016X}: {url} ({size} bytes), block {} timeout {}s",
            params.role,
            active.fabric_index,
            active.node_id,
            params.block_size,
            params.timeout.as_secs()
        );
        active.timeout = params.timeout;
        active.prepared = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_slot() -> TransferSlot {
        let mut slot = TransferSlot::new();
        slot.register_sender_handler().unwrap();
        slot
    }

    fn claim(slot: &mut TransferSlot, node_id: NodeId) -> Result<(), BdxError> {
        slot.initialize_transfer(1, node_id)?;
        slot.set_image_source_url("https://images.local/fw.bin", 10);
        slot.prepare_for_transfer(&TransferParams::default())
    }

    #[test]
    fn requires_registration() {
        let mut slot = TransferSlot::new();
        assert_eq!(slot.initialize_transfer(1, 1), Err(BdxError::NotInitialized));
    }

    #[tokio::test(start_paused = true)]
    async fn one_transfer_at_a_time() {
        let mut slot = ready_slot();
        claim(&mut slot, 0xA).unwrap();
        assert!(slot.active.as_ref().unwrap().prepared);
        assert_eq!(slot.initialize_transfer(1, 0xB), Err(BdxError::Busy));
    }

    #[tokio::test(start_paused = true)]
    async fn slot_frees_after_timeout() {
        let mut slot = ready_slot();
        claim(&mut slot, 0xA).unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(slot.initialize_transfer(1, 0xB), Err(BdxError::Busy));

        tokio::time::advance(Duration::from_secs(1)).await;
        claim(&mut slot, 0xB).unwrap();
        assert_eq!(slot.active.as_ref().unwrap().node_id, 0xB);
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_without_source_releases_slot() {
        let mut slot = ready_slot();
        slot.initialize_transfer(1, 0xA).unwrap();
        assert!(matches!(
            slot.prepare_for_transfer(&TransferParams::default()),
            Err(BdxError::Setup(_))
        ));
        assert!(slot.active.is_none());
    }

    #[test]
    fn prepare_without_claim() {
        let mut slot = ready_slot();
        assert_eq!(
            slot.prepare_for_transfer(&TransferParams::default()),
            Err(BdxError::NotInitialized)
        );
    }
}
