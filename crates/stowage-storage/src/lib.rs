//! Stowage Storage - receives backup files and reclaims expired ones
//!
//! Job scripts open one TCP connection per file. The connection names the
//! task and the file, then streams the content until EOF. Files land under
//! `<root>/<namespace>/` and are recorded in the task's metadata.

pub mod conn;
pub mod server;
pub mod sweep;
pub mod transfers;

pub use conn::{ConnState, Filename, IngestConn};
pub use server::IngestServer;
pub use sweep::{SweepReport, sweep_expired, sweep_loop};
pub use transfers::{ActiveTransfers, ShutdownStatus, TransferGuard};
