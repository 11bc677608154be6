pub mod settings;

pub use settings::{NetworkSettings, ReceiverSettings, Settings, TransferSettings};
