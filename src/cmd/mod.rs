//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `build`  | `Build`          |
//! | `serve`  | `Serve`          |
//! | `config` | `Config`         |

pub mod build;
pub mod config;
pub mod serve;

pub use build::cmd_build;
pub use config::cmd_config;
pub use serve::cmd_serve;
