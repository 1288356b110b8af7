use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed decoding the event carried by the log")]
    DeserializeEvent,
}
