pub mod errors;
pub mod frame;
pub mod ids;
pub mod protocol;
pub mod source;

pub use errors::RelayError;
pub use frame::{FrameExtractor, JPEG_END, JPEG_START};
pub use ids::ConnectionId;
pub use protocol::{ClientCommand, ServerEvent};
