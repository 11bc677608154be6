pub mod finalize;
pub mod receiver;
pub mod reconcile;
pub mod sender;
pub mod splitter;
pub mod throughput;
pub mod tracker;

pub use receiver::{ConnectionHandler, ReceiverEvent, TransferReceiver};
pub use sender::TransferSender;
pub use splitter::{split_ranges, ByteRange};
pub use tracker::{DownloadTracker, TransferHandle, TransferSnapshot};
