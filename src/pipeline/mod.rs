// =============================================================================
// Real-time candle pipeline: tick aggregation, fan-out, TF resampling
// =============================================================================

pub mod aggregator;
pub mod fanout;
pub mod tf_builder;

pub use aggregator::Aggregator;
pub use fanout::FanoutBus;
pub use tf_builder::TfBuilder;
