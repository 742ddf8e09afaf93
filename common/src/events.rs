use log::trace;
use tokio::sync::broadcast;

// Advisory events emitted at defined points of the ingestion pipeline.
// Consumers may subscribe for observability; nothing in the pipeline
// depends on a subscriber existing.
#[derive(Debug, Clone)]
pub enum IngestEvent {
    ProviderRequestStarted {
        domain: String,
        provider: String,
        operation: String,
    },
    ProviderRequestSucceeded {
        domain: String,
        provider: String,
        operation: String,
        elapsed_ms: u64,
    },
    ProviderRequestFailed {
        domain: String,
        provider: String,
        operation: String,
        error: String,
    },
    ProviderRateLimited {
        domain: String,
        provider: String,
        retry_in_ms: u64,
    },
    ProviderBackoff {
        domain: String,
        provider: String,
        attempt: u32,
        delay_ms: u64,
    },
    ProviderCircuitOpen {
        domain: String,
        provider: String,
    },
    ProviderSelected {
        domain: String,
        provider: String,
        resumed_from: Option<String>,
    },
    ImportBatchSaved {
        account_id: u64,
        stream_type: String,
        inserted: u64,
        skipped: u64,
    },
    ProcessBatchStarted {
        account_id: u64,
        source: String,
        size: usize,
    },
    ProcessBatchCompleted {
        account_id: u64,
        source: String,
        produced: usize,
        elapsed_ms: u64,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<IngestEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.sender.subscribe()
    }

    // Send errors only mean nobody is listening, which is fine
    pub fn emit(&self, event: IngestEvent) {
        trace!("emit event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_does_not_fail() {
        let bus = EventBus::new(8);
        bus.emit(IngestEvent::ProviderCircuitOpen {
            domain: "ethereum".into(),
            provider: "etherscan".into(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(IngestEvent::ImportBatchSaved {
            account_id: 7,
            stream_type: "normal".into(),
            inserted: 10,
            skipped: 2,
        });

        match rx.recv().await.unwrap() {
            IngestEvent::ImportBatchSaved {
                account_id,
                inserted,
                skipped,
                ..
            } => {
                assert_eq!(account_id, 7);
                assert_eq!(inserted, 10);
                assert_eq!(skipped, 2);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
