pub mod receipts;
pub mod summary;
