use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("Failed to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: rumqttc::ConnectionError,
    },

    #[error("Event channel closed while {0} connector was running")]
    ChannelClosed(&'static str),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
