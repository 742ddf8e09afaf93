use std::collections::HashSet;

use lazy_static::lazy_static;

// Pluggable spam-detection capability. The heuristics live outside the
// ingestion core; processors only consume the verdict to annotate
// transactions (never to drop them).
pub trait ScamDetector: Send + Sync {
    fn is_spam_contract(&self, contract: &str) -> bool;
}

lazy_static! {
    // Seed list of token contracts observed in airdrop spam campaigns
    static ref KNOWN_SPAM_CONTRACTS: HashSet<&'static str> = HashSet::from([
        "0x0df62d2cd80591798721ddc93001afe868c367ff",
        "0x4a2c786651229175407d3a2d405d1998bcf40614",
        "0x8f9b4525681f3ea6e43b8e0a57bfff86c0a1dd2e",
    ]);
}

// List-backed detector: a contract is spam when it is on the list
pub struct StaticScamList {
    contracts: HashSet<String>,
}

impl StaticScamList {
    pub fn new<I, S>(contracts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            contracts: contracts
                .into_iter()
                .map(|contract| contract.into().to_lowercase())
                .collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(KNOWN_SPAM_CONTRACTS.iter().copied())
    }
}

impl ScamDetector for StaticScamList {
    fn is_spam_contract(&self, contract: &str) -> bool {
        self.contracts.contains(&contract.to_lowercase())
    }
}
