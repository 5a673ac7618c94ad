pub mod evaluator;
pub mod sizing;

pub use evaluator::{Decision, EvaluatorSettings, SkipReason, TriggerEvaluator};
