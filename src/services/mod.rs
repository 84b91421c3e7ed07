// Stage rules
pub mod stage_catalog;

// Production ledger primitives
pub mod allocations;
pub mod invoice_gate;
pub mod process_instances;

// Collaborators and reference data
pub mod collaborators;
pub mod manufacturers;

// Operations
pub mod advancement;
pub mod completion;
pub mod order_intake;

// Read views
pub mod history;
