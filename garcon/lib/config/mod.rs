//! Configuration types for garcon: process settings, template documents and
//! the per-server sidecar.

mod server;
mod settings;
mod template;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use server::*;
pub use settings::*;
pub use template::*;
