//! Builds the EIP-155 chain registry this facilitator binary serves from
//! its loaded [`ChainsConfig`].

use std::collections::HashMap;
use std::sync::Arc;

use x402_core::chain::{ChainProviderOps, ChainRegistry, FromConfig};
use x402_eip155_exact::chain::Eip155ChainProvider;

use crate::config::ChainsConfig;

/// Connects one [`Eip155ChainProvider`] per configured chain and returns the
/// registry the facilitator routes `(scheme, network)` lookups through.
pub async fn build_chain_registry(
    chains: &ChainsConfig,
) -> Result<ChainRegistry<Arc<Eip155ChainProvider>>, Box<dyn std::error::Error>> {
    let mut providers = HashMap::new();
    for chain_config in chains.iter() {
        let provider = Arc::new(Eip155ChainProvider::from_config(chain_config).await?);
        providers.insert(provider.chain_id(), provider);
    }
    Ok(ChainRegistry::new(providers))
}
