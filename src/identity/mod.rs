pub mod address;
pub mod bootstrap;
pub mod mock_overlay;
pub mod overlay;
pub mod udp_overlay;
pub mod user_id;

pub use address::Address;
pub use bootstrap::BootstrapNode;
pub use overlay::{FriendEvent, FriendOverlay};
pub use user_id::UserId;
