mod dispatcher;
mod error;

pub use dispatcher::*;
pub(crate) use error::*;
