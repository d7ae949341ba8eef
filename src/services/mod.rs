pub mod processor;
pub mod queue;
pub mod remover;
pub mod retrieval;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod transform;
