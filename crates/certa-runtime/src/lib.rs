//! CERTA Runtime - Node orchestration around the certification engine
//!
//! The node runs three kinds of actors:
//! 1. One certifier task consuming the delivery stream in global order
//! 2. Applier tasks applying certified write sets in parallel, each waiting
//!    in the apply monitor until its dependency has been applied
//! 3. The purge step inside the certifier, releasing applied trxs from the
//!    index at commit cuts or as the apply monitor advances

pub mod config;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod node;

pub use config::*;
pub use error::*;
pub use logging::*;
pub use monitor::*;
pub use node::*;
