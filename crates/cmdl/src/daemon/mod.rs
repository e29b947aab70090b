pub mod bootstrap;
pub mod dispatcher;
pub mod shutdown;
pub mod worker;

pub use bootstrap::{start, stop};
