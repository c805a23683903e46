pub mod booking;
pub mod client;
pub mod crm_event;
pub mod import;
pub mod order;
pub mod outbox;
