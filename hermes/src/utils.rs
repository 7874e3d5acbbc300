mod common;
pub use common::{OrError, epoch_millis, parse_topics};
