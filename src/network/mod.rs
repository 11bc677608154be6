pub mod codec;
pub mod protocol;

pub use codec::{Connection, PeerConnection, RawBody};
pub use protocol::{PartMetadata, RequestHeader, RequestType};
