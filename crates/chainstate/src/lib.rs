//! The validation core: block-index forest, layered coins views, undo data,
//! block and transaction validation, the best-chain selector with its reorg
//! driver, mempool admission, and the flush/prune controller.

pub mod blockindex;
pub mod chain;
pub mod checkqueue;
pub mod coins;
pub mod error;
pub mod events;
pub mod filemeta;
pub mod flatfiles;
pub mod locks;
pub mod mempool_accept;
pub mod state;
pub mod undo;
pub mod validate;

pub use error::{ChainstateError, RejectCode, ValidationFailure};
pub use state::{ChainState, ChainStateConfig, FlushMode};
