//! Terminal Dashboard
//!
//! - `app`: dashboard state and event loop
//! - `views`: rendering for the loan tabs, portfolio and status bar
//!
//! The dashboard only renders what the core returns and forwards key
//! presses as actions; legality and error kinds come from the library.

mod app;
mod views;

pub use app::{run_app, App};
