pub mod builder;
pub mod chain;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod remote;
pub mod services;
pub mod signing;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_util;

pub use error::{CoreError, RpcError};
pub use executor::{Executor, ExecutorConfig, Services};
pub use types::{PlanId, UserId};
