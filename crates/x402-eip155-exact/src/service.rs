//! [`X402SchemeService`] for the `exact` scheme: turns a human price into full
//! [`PaymentRequirements`] against the canonical stablecoin for a network.

use x402_core::chain::{ChainId, ChainIdPattern};
use x402_core::proto::{PaymentRequirements, SupportedResponse};
use x402_core::scheme::{PriceParseError, X402SchemeService};
use x402_core::util::money_amount::MoneyAmount;

use crate::chain::{AssetTransferMethod, Eip155TokenDeployment};
use crate::KnownNetworkEip155;
use x402_core::networks::USDC;

/// Resolves the canonical USDC deployment for `network`, the fixed table driving
/// `parsePrice`. Returns `None` for networks this crate doesn't carry a stablecoin
/// entry for.
fn usdc_deployment(network: &ChainId) -> Option<Eip155TokenDeployment> {
    match network.reference() {
        "8453" => Some(USDC::base()),
        "84532" => Some(USDC::base_sepolia()),
        "137" => Some(USDC::polygon()),
        "80002" => Some(USDC::polygon_amoy()),
        "43114" => Some(USDC::avalanche()),
        "43113" => Some(USDC::avalanche_fuji()),
        "1329" => Some(USDC::sei()),
        "1328" => Some(USDC::sei_testnet()),
        "50" => Some(USDC::xdc()),
        "1440000" => Some(USDC::xrpl_evm()),
        "3338" => Some(USDC::peaq()),
        "4689" => Some(USDC::iotex()),
        "42220" => Some(USDC::celo()),
        "11142220" => Some(USDC::celo_sepolia()),
        _ => None,
    }
}

/// Service-side scheme binding: converts `"$X.YZ"` prices into `PaymentRequirements`
/// for the `exact` scheme on a single EIP-155 chain.
pub struct Eip155ExactService {
    network_pattern: ChainIdPattern,
}

impl Eip155ExactService {
    pub fn new(chain_id: ChainId) -> Self {
        let network_pattern = ChainIdPattern::exact(chain_id.namespace(), chain_id.reference());
        Self { network_pattern }
    }
}

impl X402SchemeService for Eip155ExactService {
    fn scheme(&self) -> &'static str {
        "exact"
    }

    fn network_pattern(&self) -> &ChainIdPattern {
        &self.network_pattern
    }

    fn parse_price(
        &self,
        price: &MoneyAmount,
        network: &ChainId,
        pay_to: &str,
        max_timeout_seconds: u64,
    ) -> Result<PaymentRequirements, PriceParseError> {
        let token = usdc_deployment(network).ok_or_else(|| PriceParseError::UnknownNetwork(network.clone()))?;
        if price.scale() > token.decimals as u32 {
            return Err(PriceParseError::Money(
                x402_core::util::money_amount::MoneyAmountParseError::WrongPrecision {
                    money: price.scale(),
                    token: token.decimals as u32,
                },
            ));
        }
        let scale_factor = 10u128.pow(token.decimals as u32 - price.scale());
        let amount = price.mantissa() * scale_factor;

        let extra = match &token.transfer_method {
            AssetTransferMethod::Eip3009 { name, version } => {
                serde_json::to_value(serde_json::json!({ "name": name, "version": version })).ok()
            }
            AssetTransferMethod::Permit2 => serde_json::to_value(serde_json::json!({ "assetTransferMethod": "permit2" })).ok(),
        };

        Ok(PaymentRequirements {
            scheme: "exact".to_string(),
            network: network.clone(),
            asset: token.address.to_string(),
            amount: amount.to_string(),
            pay_to: pay_to.to_string(),
            max_timeout_seconds,
            extra,
        })
    }

    fn enhance(&self, _requirements: &mut PaymentRequirements, _capabilities: &SupportedResponse) {
        // The exact scheme's requirements are fully determined by parse_price;
        // nothing to enrich once /supported capabilities are known.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x402_core::networks::chain_id_by_network_name;

    fn base_sepolia() -> ChainId {
        chain_id_by_network_name("base-sepolia").unwrap().clone()
    }

    #[test]
    fn scales_price_to_token_base_units() {
        let network = base_sepolia();
        let service = Eip155ExactService::new(network.clone());
        let price = MoneyAmount::parse("0.01").unwrap();
        let requirements = service.parse_price(&price, &network, "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA9604", 60).unwrap();
        assert_eq!(requirements.amount, "10000");
        assert_eq!(requirements.scheme, "exact");
        assert_eq!(requirements.network, network);
    }

    #[test]
    fn eip3009_extra_carries_domain_name_and_version() {
        let network = base_sepolia();
        let service = Eip155ExactService::new(network.clone());
        let price = MoneyAmount::parse("1").unwrap();
        let requirements = service.parse_price(&price, &network, "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA9604", 60).unwrap();
        let extra = requirements.extra.unwrap();
        assert_eq!(extra["name"], "USDC");
        assert!(extra.get("version").is_some());
    }

    #[test]
    fn rejects_price_finer_than_token_decimals() {
        let network = base_sepolia();
        let service = Eip155ExactService::new(network.clone());
        let price = MoneyAmount::parse("0.0000001").unwrap();
        let err = service.parse_price(&price, &network, "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA9604", 60).unwrap_err();
        assert!(matches!(err, PriceParseError::Money(_)));
    }

    #[test]
    fn unknown_network_is_rejected() {
        let network = ChainId::new("eip155", "999999999");
        let service = Eip155ExactService::new(network.clone());
        let price = MoneyAmount::parse("0.01").unwrap();
        let err = service.parse_price(&price, &network, "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA9604", 60).unwrap_err();
        assert!(matches!(err, PriceParseError::UnknownNetwork(_)));
    }
}
