pub mod auto_tune;
pub mod high_availability;
pub mod indexed;
pub mod message;
pub mod pipe;
pub mod reader;
pub mod registry;
pub mod uplink;
pub mod watchdog;
