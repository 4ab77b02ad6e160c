mod error;
mod types;

pub use error::*;
pub use types::*;

pub use tokio_util::sync::CancellationToken;
