pub mod dataset;
pub mod recommendation;
pub mod training;
