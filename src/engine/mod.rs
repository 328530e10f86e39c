pub mod pipeline;
pub mod projector;
