//! BlueZ adapter access: radio state and paired device enumeration

use crate::transport::traits::{PeerIdentity, RadioState};
use anyhow::Result;
use bluer::{Adapter, Address, Session};
use tracing::{debug, warn};

/// Handle on the default BlueZ adapter
pub struct BtAdapter {
    session: Session,
    adapter: Adapter,
}

impl BtAdapter {
    /// Open the default Bluetooth adapter
    ///
    /// Does not power the adapter on; enabling the radio is left to the user.
    pub async fn open() -> Result<Self> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        debug!("[BT] Using adapter {}", adapter.name());
        Ok(Self { session, adapter })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Report whether the adapter is powered
    pub async fn radio_state(&self) -> RadioState {
        match self.adapter.is_powered().await {
            Ok(true) => RadioState::Enabled,
            Ok(false) => RadioState::Disabled,
            Err(e) => {
                warn!("[BT] Unable to query adapter power state: {}", e);
                RadioState::Unavailable
            }
        }
    }

    /// List devices bonded with this adapter, sorted by name
    pub async fn paired_peers(&self) -> Result<Vec<PeerIdentity>> {
        let mut peers = Vec::new();
        for addr in self.adapter.device_addresses().await? {
            let device = self.adapter.device(addr)?;
            if let Ok(true) = device.is_paired().await {
                peers.push(self.peer_identity(addr).await);
            }
        }

        peers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(peers)
    }

    /// Resolve a display name for a device address
    pub async fn peer_identity(&self, addr: Address) -> PeerIdentity {
        let name = match self.adapter.device(addr) {
            Ok(device) => device.alias().await.ok(),
            Err(_) => None,
        };
        let address = addr.to_string();
        PeerIdentity {
            name: name.unwrap_or_else(|| address.clone()),
            address,
        }
    }
}
