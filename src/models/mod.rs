//! Data models for workcopy

pub mod conflict;
pub mod credential;
pub mod diff;
pub mod operation;
pub mod repository;
pub mod submodule;
pub mod transfer;

pub use conflict::*;
pub use credential::*;
pub use diff::*;
pub use operation::*;
pub use repository::*;
pub use submodule::*;
pub use transfer::*;
