//! Session, session manager, and the `Carrier` facade (spec §4.1, §4.2, §9).

pub mod carrier;
pub mod manager;
pub mod session;

pub use carrier::Carrier;
pub use manager::{RequestCallback, SessionManager};
pub use session::{Session, SessionState};
