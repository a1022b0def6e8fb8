pub mod consumer;
pub mod processor;
pub mod queue;
pub mod recovery;
pub mod results;
pub mod transform;
