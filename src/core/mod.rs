pub mod error;

pub use error::{CommandError, Result};
