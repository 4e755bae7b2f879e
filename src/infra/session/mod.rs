//! Wallet session holding the connected caller's address.

use std::sync::RwLock;

use tracing::info;

use crate::domain::{Address, Identity, IdentityResolver};

/// In-process view of the external wallet connection.
///
/// The wallet integration calls [`WalletSession::connect`] and
/// [`WalletSession::disconnect`]; everything else only reads it.
#[derive(Debug, Default)]
pub struct WalletSession {
    identity: RwLock<Identity>,
}

impl WalletSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn connected(address: Address) -> Self {
        Self {
            identity: RwLock::new(Identity::connected(address)),
        }
    }

    pub fn connect(&self, address: Address) {
        info!(address = %address, "Wallet connected");
        if let Ok(mut identity) = self.identity.write() {
            *identity = Identity::connected(address);
        }
    }

    pub fn disconnect(&self) {
        info!("Wallet disconnected");
        if let Ok(mut identity) = self.identity.write() {
            *identity = Identity::disconnected();
        }
    }
}

impl IdentityResolver for WalletSession {
    fn current_identity(&self) -> Identity {
        self.identity
            .read()
            .map(|identity| identity.clone())
            .unwrap_or_default()
    }
}
