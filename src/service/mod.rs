pub mod extraction;
pub mod grn;
pub mod ingestion;
pub mod inventory;
pub mod matcher;
pub mod outbox;
pub mod parser;
pub mod reconciliation;
pub mod storage;

pub use extraction::TextExtractor;
pub use grn::GrnService;
pub use ingestion::{IngestionService, ParseWorker};
pub use inventory::InventoryService;
pub use matcher::ProductMatcher;
pub use outbox::{MessageBus, OutboxRelay};
pub use parser::InvoiceParser;
pub use reconciliation::ReconciliationService;
pub use storage::DocumentStore;
