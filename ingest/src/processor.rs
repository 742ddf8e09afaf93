use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use log::trace;
use serde::de::DeserializeOwned;
use serde_json::Value;

use tally_common::asset;
use tally_common::transaction::ProcessedTransaction;

use crate::error::IngestError;
use crate::scam::ScamDetector;

// What a processor knows about the account being derived. Blockchains get
// the user's address set; exchanges get an empty context.
#[derive(Debug, Clone, Default)]
pub struct ProcessingContext {
    pub user_addresses: HashSet<String>,
    pub primary_address: Option<String>,
}

impl ProcessingContext {
    pub fn for_address(address: &str) -> Self {
        let address = address.to_lowercase();
        Self {
            user_addresses: HashSet::from([address.clone()]),
            primary_address: Some(address),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn owns_address(&self, address: &str) -> bool {
        self.user_addresses.contains(&address.to_lowercase())
    }
}

// Pure, schema-validated transformation from normalized provider data to
// the canonical transaction model
pub trait Processor: Send + Sync {
    fn process(
        &self,
        batch: &[Value],
        context: &ProcessingContext,
    ) -> Result<Vec<ProcessedTransaction>, IngestError>;
}

// Per-source transformation over already-validated input. Implementations
// must be deterministic: identical input and context derive identical
// output.
pub trait Transform: Send + Sync {
    type Input: DeserializeOwned;

    fn source(&self) -> &str;

    fn transform(
        &self,
        batch: Vec<Self::Input>,
        context: &ProcessingContext,
    ) -> Result<Vec<ProcessedTransaction>, IngestError>;
}

// Wraps a transform with input decoding, strict output validation and
// optional scam annotation. External data is inherently dynamic, so the
// decode step is where the typed world begins.
pub struct SchemaProcessor<T: Transform> {
    transform: T,
    scam_detector: Option<Arc<dyn ScamDetector>>,
}

impl<T: Transform> SchemaProcessor<T> {
    pub fn new(transform: T) -> Self {
        Self {
            transform,
            scam_detector: None,
        }
    }

    pub fn with_scam_detector(mut self, detector: Arc<dyn ScamDetector>) -> Self {
        self.scam_detector = Some(detector);
        self
    }
}

impl<T: Transform> Processor for SchemaProcessor<T> {
    fn process(
        &self,
        batch: &[Value],
        context: &ProcessingContext,
    ) -> Result<Vec<ProcessedTransaction>, IngestError> {
        trace!(
            "processing {} records from '{}'",
            batch.len(),
            self.transform.source()
        );

        // 1. decode against the declared input shape; strict, no partial batch
        let mut typed = Vec::with_capacity(batch.len());
        for (index, value) in batch.iter().enumerate() {
            match serde_json::from_value::<T::Input>(value.clone()) {
                Ok(record) => typed.push(record),
                Err(e) => {
                    return Err(IngestError::Validation {
                        field_path: e.to_string(),
                        record_index: index,
                    })
                }
            }
        }

        // 2. transform
        let inputs = typed.len();
        let mut outputs = self.transform.transform(typed, context)?;

        // 3. a processor may merge rows but never silently drop them all
        if inputs > 0 && outputs.is_empty() {
            return Err(IngestError::EmptyProcessorOutput {
                source_name: self.transform.source().to_owned(),
                inputs,
            });
        }

        for (index, transaction) in outputs.iter().enumerate() {
            transaction
                .validate()
                .map_err(|e| IngestError::Validation {
                    field_path: e.to_string(),
                    record_index: index,
                })?;
        }

        // 4. annotation only, never a drop
        if let Some(detector) = &self.scam_detector {
            annotate_spam(&mut outputs, detector.as_ref());
        }

        Ok(outputs)
    }
}

// Ask the detector once per contract across the transaction's movements
fn annotate_spam(transactions: &mut [ProcessedTransaction], detector: &dyn ScamDetector) {
    for transaction in transactions.iter_mut() {
        let contracts: BTreeSet<&str> = transaction
            .movements
            .inflows
            .iter()
            .chain(transaction.movements.outflows.iter())
            .filter_map(|movement| asset::contract_of(&movement.asset_id))
            .collect();

        let flagged: Vec<&str> = contracts
            .into_iter()
            .filter(|contract| detector.is_spam_contract(contract))
            .collect();

        if !flagged.is_empty() {
            transaction.is_spam = true;
            transaction
                .notes
                .push(format!("flagged as spam: {}", flagged.join(", ")));
        }
    }
}
