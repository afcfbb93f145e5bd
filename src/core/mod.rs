pub mod ack;
pub mod error;
pub mod inventory;
pub mod listener;
pub mod message;
pub mod pool;
pub mod sequencer;
