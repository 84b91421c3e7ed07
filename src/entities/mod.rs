// Reference data
pub mod manufacturer;
pub mod product;
pub mod stage;

// Orders and their lines
pub mod line_item;
pub mod order;

// Production ledger
pub mod allocation;
pub mod employee_participation;
pub mod process_instance;

// Invoicing
pub mod invoice;
pub mod invoice_allocation;

pub use stage::Stage;
