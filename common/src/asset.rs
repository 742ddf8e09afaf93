// Canonical asset identifiers.
//
// blockchain:<chain>:native          - a chain's native coin
// blockchain:<chain>:<contract>      - a token contract on a chain
// exchange:<name>:<symbol>           - an asset held at an exchange

pub const NATIVE: &str = "native";

pub fn native(chain: &str) -> String {
    format!("blockchain:{}:{}", chain, NATIVE)
}

pub fn token(chain: &str, contract: &str) -> String {
    format!("blockchain:{}:{}", chain, contract.to_lowercase())
}

pub fn exchange(name: &str, symbol: &str) -> String {
    format!("exchange:{}:{}", name, symbol.to_uppercase())
}

// Contract address of a token asset id, None for native coins and
// exchange assets
pub fn contract_of(asset_id: &str) -> Option<&str> {
    let mut parts = asset_id.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("blockchain"), Some(_), Some(contract)) if contract != NATIVE => Some(contract),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_id_shapes() {
        assert_eq!(native("ethereum"), "blockchain:ethereum:native");
        assert_eq!(
            token("ethereum", "0xDAC17f958d2EE523a2206206994597c13d831EC7"),
            "blockchain:ethereum:0xdac17f958d2ee523a2206206994597c13d831ec7"
        );
        assert_eq!(exchange("kraken", "btc"), "exchange:kraken:BTC");
    }

    #[test]
    fn test_contract_extraction() {
        assert_eq!(contract_of("blockchain:ethereum:0xabc"), Some("0xabc"));
        assert_eq!(contract_of("blockchain:ethereum:native"), None);
        assert_eq!(contract_of("exchange:kraken:BTC"), None);
        assert_eq!(contract_of("garbage"), None);
    }
}
