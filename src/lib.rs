//! Preference-pair (DPO) data pipeline and losses for fine-tuning causal
//! language models with candle.

pub mod candle_addons;
pub mod config;
pub mod datasets;
pub mod inspect;
pub mod losses;
pub mod model;
pub mod scoring;
pub mod tokenizer;
